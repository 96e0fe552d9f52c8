use criterion::{Criterion, criterion_group, criterion_main};
use exchange_engine::matcher;
use exchange_engine::orderbook::{BookEntry, OrderBook};
use exchange_engine::orders::Side;
use std::hint::black_box;

fn setup_order_book(depth: u64, orders_per_level: u64) -> OrderBook {
    let mut book = OrderBook::new();
    let mut id = 1u64;
    for level in 0..depth {
        for _ in 0..orders_per_level {
            book.insert(
                Side::Sell,
                101_00 + level * 50,
                BookEntry { id, user: 1, qty: 1 },
            );
            id += 1;
            book.insert(
                Side::Buy,
                99_00 - level * 50,
                BookEntry { id, user: 2, qty: 1 },
            );
            id += 1;
        }
    }
    book
}

fn bench_matching(c: &mut Criterion) {
    let depth = 100;
    let orders_per_level = 10;
    let book = setup_order_book(depth, orders_per_level);

    c.bench_function("market walk over half the book", |b| {
        b.iter(|| {
            let result = matcher::match_order(
                depth * orders_per_level / 2,
                book.iter_matching(Side::Buy, None),
                None,
            );
            black_box(result)
        })
    });

    c.bench_function("bounded walk, three levels deep", |b| {
        b.iter(|| {
            let result = matcher::match_order(
                orders_per_level * 3,
                book.iter_matching(Side::Sell, Some(98_00)),
                None,
            );
            black_box(result)
        })
    });

    c.bench_function("cash-bounded market walk", |b| {
        b.iter(|| {
            let result = matcher::match_order(
                depth * orders_per_level,
                book.iter_matching(Side::Buy, None),
                Some(5_000_00),
            );
            black_box(result)
        })
    });
}

fn bench_book_churn(c: &mut Criterion) {
    c.bench_function("insert then cancel one order", |b| {
        let mut book = setup_order_book(10, 10);
        b.iter(|| {
            book.insert(
                Side::Buy,
                95_25,
                BookEntry {
                    id: u64::MAX,
                    user: 3,
                    qty: 5,
                },
            );
            black_box(book.remove(u64::MAX));
        })
    });
}

criterion_group!(benches, bench_matching, bench_book_churn);
criterion_main!(benches);
