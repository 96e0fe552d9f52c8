use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use bincode::{
    config::standard,
    error::{DecodeError, EncodeError},
};
use parity_db::{BTreeIterator, ColId, Db, Options};
use std::path::Path;
use thiserror::Error;

use crate::orders::SymbolId;
use crate::trade::Trade;

// Versioned, opaque cursor encoded as URL-safe base64 JSON.
#[derive(serde::Serialize, serde::Deserialize)]
struct Cursor {
    v: u8, // cursor schema version; must be 1
    seq: u64,
}

/// Errors from the key/value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ParityDB error: {0}")]
    Parity(#[from] parity_db::Error),
    #[error("Serialization/Deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Bincode encode error: {0}")]
    BincodeEncode(#[from] EncodeError),

    #[error("Bincode decode error: {0}")]
    BincodeDecode(#[from] DecodeError),

    #[error("Invalid cursor")]
    BadCursor,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only ParityDB store for executed trades.
///
/// Key layout (big-endian for lexicographic ordering):
/// `symbol_id(u64) + seq(u64)`
///
/// The engine's global execution sequence is strictly increasing, so keys
/// under each symbol prefix are already chronological with no tie-breakers
/// needed.
pub struct Store {
    db: Db,
}

impl Store {
    /// Open (or create) a ParityDB at `path`, with a single column and B-tree index.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::with_columns(path.as_ref(), 1);
        // enable B-tree index on column 0 for prefix scans
        opts.columns[0].btree_index = true;
        let db = Db::open_or_create(&opts)?;
        Ok(Store { db })
    }

    #[inline]
    fn prefix(symbol: SymbolId) -> Vec<u8> {
        symbol.to_be_bytes().to_vec()
    }

    #[inline]
    fn encode_key(symbol: SymbolId, seq: u64) -> Vec<u8> {
        let mut key = Self::prefix(symbol);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    #[inline]
    fn encode_cursor(c: &Cursor) -> StoreResult<String> {
        Ok(B64.encode(serde_json::to_vec(c)?))
    }

    #[inline]
    fn decode_cursor(s: &str) -> StoreResult<Cursor> {
        let bytes = B64.decode(s).map_err(|_| StoreError::BadCursor)?;
        let c: Cursor = serde_json::from_slice(&bytes).map_err(|_| StoreError::BadCursor)?;
        if c.v != 1 {
            return Err(StoreError::BadCursor);
        }
        Ok(c)
    }

    /// Append a trade under its (symbol, seq) key.
    pub fn insert_trade(&mut self, trade: &Trade) -> StoreResult<()> {
        let col: ColId = 0;
        let key = Self::encode_key(trade.symbol, trade.seq);
        let value = bincode::encode_to_vec(trade, standard())?;
        self.db.commit(vec![(col, key, Some(value))])?;
        Ok(())
    }

    /// Page forward (ascending time) for a symbol, starting *strictly after*
    /// `after`.
    ///
    /// Returns `(items, next_cursor)`. `next_cursor` is `Some(_)` only if
    /// there is at least one more item beyond the returned page (look-ahead
    /// pagination).
    pub fn page_trades_asc(
        &self,
        symbol: SymbolId,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<(Vec<Trade>, Option<String>)> {
        let col: ColId = 0;
        let mut it: BTreeIterator<'_> = self.db.iter(col)?;
        let prefix = Self::prefix(symbol);

        match after {
            Some(s) => {
                // Validate that the exact key exists for this symbol, then
                // start strictly after it.
                let cursor = Self::decode_cursor(s)?;
                let full = Self::encode_key(symbol, cursor.seq);
                it.seek(&full)?;
                match it.next()? {
                    Some((k, _)) if k == full => {
                        // positioned just after `after`
                    }
                    _ => return Err(StoreError::BadCursor),
                }
            }
            None => it.seek(&prefix)?,
        }

        // Look-ahead read: limit + 1 to know if there is another page.
        let mut items: Vec<Trade> = Vec::with_capacity(limit.min(256));
        let mut last_cursor_for_page: Option<String> = None;
        let mut read = 0usize;

        while read < limit + 1 {
            match it.next()? {
                Some((k, v)) if k.starts_with(&prefix) => {
                    let (trade, _): (Trade, usize) = bincode::decode_from_slice(&v, standard())?;
                    if items.len() < limit {
                        last_cursor_for_page =
                            Some(Self::encode_cursor(&Cursor { v: 1, seq: trade.seq })?);
                        items.push(trade);
                    }
                    read += 1;
                }
                _ => break,
            }
        }

        // Only expose a `next` cursor if there was at least one more record
        // beyond this page.
        let next = if read > limit && !items.is_empty() {
            last_cursor_for_page
        } else {
            None
        };

        Ok((items, next))
    }

    /// Delete every stored trade for a symbol (used when a symbol is
    /// deleted).
    pub fn delete_trades(&mut self, symbol: SymbolId) -> StoreResult<()> {
        let col: ColId = 0;
        let mut iter = self.db.iter(col)?;
        let prefix = Self::prefix(symbol);
        iter.seek(&prefix)?;

        let mut batch = Vec::new();
        while let Some((key, _)) = iter.next()? {
            if !key.starts_with(&prefix) {
                break;
            }
            batch.push((col, key.to_vec(), None));
        }
        if !batch.is_empty() {
            self.db.commit(batch)?;
        }
        Ok(())
    }
}
