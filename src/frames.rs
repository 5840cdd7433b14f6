//! Batches a fallible row iterator into fixed-size chunks for the
//! `UpsertEngine` — §4.5 step 4 ("buffer rows into per-file batches of fixed
//! size"). A batch short-circuits as soon as the first row error is seen so
//! the caller can fail the file without silently dropping the remainder.

use crate::errors::Error;

pub struct RowBatches<R> {
    rows: R,
    batch_size: usize,
}

impl<R> RowBatches<R>
where
    R: Iterator,
{
    pub fn new(rows: R, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self { rows, batch_size }
    }
}

impl<R, T> Iterator for RowBatches<R>
where
    R: Iterator<Item = Result<T, Error>>,
{
    type Item = Result<Vec<T>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            match self.rows.next() {
                Some(Ok(row)) => batch.push(row),
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_rows_into_fixed_size_batches() {
        let rows: Vec<Result<u32, Error>> = (0..7).map(Ok).collect();
        let batches: Vec<Vec<u32>> = RowBatches::new(rows.into_iter(), 3).map(|b| b.unwrap()).collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn stops_at_the_first_row_error() {
        let rows: Vec<Result<u32, Error>> = vec![Ok(1), Ok(2), Err(Error::PermanentIo("bad row".into())), Ok(4)];
        let mut batches = RowBatches::new(rows.into_iter(), 10);
        assert!(batches.next().unwrap().is_err());
        assert!(batches.next().is_none());
    }
}
