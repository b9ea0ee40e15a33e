use crate::compress::decompress_vec;
use crate::error::Result;
use crate::storage::{TransactionIterator, TransactionRecord};

/// Wraps a storage's transaction iterator, inflating every data record it yields.
///
/// Once closed, the wrapped iterator is closed and dropped, and this one yields nothing more,
/// even if the wrapped iterator would have kept going.
pub struct DecompressingIterator {
    inner: Option<Box<dyn TransactionIterator>>,
}

impl DecompressingIterator {
    pub fn new(inner: Box<dyn TransactionIterator>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

fn decompress_records(mut txn: TransactionRecord) -> Result<TransactionRecord> {
    for record in txn.records.iter_mut() {
        if let Some(data) = record.data.take() {
            record.data = Some(decompress_vec(data)?);
        }
    }
    Ok(txn)
}

impl Iterator for DecompressingIterator {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let txn = self.inner.as_mut()?.next()?;
        Some(txn.and_then(decompress_records))
    }
}

impl TransactionIterator for DecompressingIterator {
    fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }
}
