//! LanceDB connection and column helpers shared by the registry, vector
//! store and queue tables.
use anyhow::{anyhow, Result};
use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use lancedb::{connect, Connection};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Ids per `IN (...)` predicate.
pub const FILTER_CHUNK: usize = 256;

pub async fn open_db(uri: &str) -> Result<Connection> {
    Ok(connect(uri).execute().await?)
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<()> {
    let names = conn.table_names().execute().await?;
    if names.contains(&name.to_string()) {
        return Ok(());
    }
    // create empty table with 0 rows
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
    conn.create_table(name, Box::new(iter)).execute().await?;
    Ok(())
}

pub type BatchReader = RecordBatchIterator<std::vec::IntoIter<std::result::Result<RecordBatch, arrow_schema::ArrowError>>>;

pub fn single_batch_reader(batch: RecordBatch) -> Box<BatchReader> {
    let schema = batch.schema();
    Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema))
}

pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn in_list(column: &str, values: &[String]) -> String {
    let list = values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",");
    format!("{} IN ({})", column, list)
}

/// Keep the `cap` smallest items seen so far; `heap` is a max-heap.
pub fn push_bounded<K: Ord>(heap: &mut BinaryHeap<K>, cap: usize, item: K) {
    if cap == 0 {
        return;
    }
    if heap.len() < cap {
        heap.push(item);
    } else if heap.peek().is_some_and(|top| item < *top) {
        heap.pop();
        heap.push(item);
    }
}

pub fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("{} column missing", name))
}

pub fn i64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| anyhow!("{} column missing", name))
}

pub fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| anyhow!("{} column missing", name))
}

pub fn opt_str(arr: &StringArray, i: usize) -> Option<String> {
    if arr.is_null(i) { None } else { Some(arr.value(i).to_string()) }
}

pub fn opt_i64(arr: &Int64Array, i: usize) -> Option<i64> {
    if arr.is_null(i) { None } else { Some(arr.value(i)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(quote("o'brien"), "'o''brien'");
        assert_eq!(in_list("id", &["a".into(), "b'c".into()]), "id IN ('a','b''c')");
    }

    #[test]
    fn bounded_heap_keeps_smallest() {
        let mut heap = BinaryHeap::new();
        for v in [9, 3, 7, 1, 8, 2] {
            push_bounded(&mut heap, 3, v);
        }
        assert_eq!(heap.into_sorted_vec(), vec![1, 2, 3]);

        let mut none = BinaryHeap::new();
        push_bounded(&mut none, 0, 1);
        assert!(none.is_empty());
    }
}
