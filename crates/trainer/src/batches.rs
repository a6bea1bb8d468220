use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;
use seq_core::Batch;

use crate::error::DataError;

/// Ordered source of batches with a rewindable read cursor.
pub trait BatchSource {
    /// Number of batches in one pass over the data.
    fn num_steps(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn num_unrollings(&self) -> usize;

    /// Moves the cursor back to where a fresh generator starts.
    fn rewind_cursor(&mut self);

    fn next_batch(&mut self) -> Batch;

    /// Whether the batch that `next_batch` would return next lies entirely
    /// within the first `min_history` rows of its sequences.
    fn is_predata(&self, min_history: usize) -> bool;
}

/// Column names and batch geometry used to read a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLayout {
    pub key_name: String,
    pub target_name: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub batch_size: usize,
    pub num_unrollings: usize,
}

#[derive(Debug, Clone)]
struct Row {
    /// Position of the row within its key's sequence.
    offset: usize,
    inputs: Vec<f32>,
    target: i64,
}

/// Consecutive rows of one key, at most `num_unrollings` long.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Window {
    start: usize,
    len: usize,
}

/// Batches over a whitespace-separated table with a header row.
///
/// The rows are split into `batch_size` contiguous lane regions of
/// `rows / batch_size` rows each, the last lane also taking the remainder.
/// Every region is cut into windows that end at a key boundary or after
/// `num_unrollings` rows, and one pass emits each lane's windows in order, so
/// every row is read exactly once per pass. A lane that runs out of windows
/// before the others is padded with empty windows until the pass ends.
pub struct BatchGenerator {
    rows: Vec<Row>,
    layout: DataLayout,
    lanes: Vec<Vec<Window>>,
    num_steps: usize,
    step: usize,
}

impl BatchGenerator {
    pub fn new<P: AsRef<Path>>(path: P, layout: &DataLayout) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file), path, layout)
    }

    /// Reads the table from `reader`; `path` is only used in error messages.
    pub fn from_reader<R: BufRead>(
        reader: R,
        path: &Path,
        layout: &DataLayout,
    ) -> Result<Self, DataError> {
        if layout.batch_size == 0 || layout.num_unrollings == 0 {
            return Err(DataError::Layout(
                "batch_size and num_unrollings must be positive".to_string(),
            ));
        }

        let mut lines = reader
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line))
            .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()));

        let header: Vec<String> = match lines.next() {
            Some((_, line)) => line
                .map_err(|source| io_error(path, source))?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => return Err(DataError::Empty { path: path.to_path_buf() }),
        };
        let columns = Columns::resolve(&header, path, layout)?;

        let mut rows = Vec::new();
        let mut last_key: Option<String> = None;
        for (line_no, line) in lines {
            let line = line.map_err(|source| io_error(path, source))?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let parse_error = |message: String| DataError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                message,
            };

            if fields.len() != header.len() {
                return Err(parse_error(format!(
                    "expected {} fields, found {}",
                    header.len(),
                    fields.len()
                )));
            }

            let inputs = columns
                .inputs
                .iter()
                .map(|&i| {
                    fields[i]
                        .parse::<f32>()
                        .map_err(|e| parse_error(format!("column {}: {}", header[i], e)))
                })
                .collect::<Result<Vec<f32>, DataError>>()?;

            let target = fields[columns.target]
                .parse::<f64>()
                .map_err(|e| parse_error(format!("column {}: {}", header[columns.target], e)))?;
            if target.fract() != 0.0 || target < 0.0 || target >= layout.num_outputs as f64 {
                return Err(parse_error(format!(
                    "target {} is not a class index in 0..{}",
                    target, layout.num_outputs
                )));
            }

            let key = fields[columns.key];
            let offset = match (&last_key, rows.last()) {
                (Some(prev), Some(Row { offset, .. })) if prev == key => offset + 1,
                _ => 0,
            };
            last_key = Some(key.to_string());

            rows.push(Row {
                offset,
                inputs,
                target: target as i64,
            });
        }

        if rows.is_empty() {
            return Err(DataError::Empty { path: path.to_path_buf() });
        }

        let stride = rows.len() / layout.batch_size;
        let lanes: Vec<Vec<Window>> = (0..layout.batch_size)
            .map(|lane| {
                let end = if lane + 1 == layout.batch_size {
                    rows.len()
                } else {
                    (lane + 1) * stride
                };
                lane_windows(&rows, lane * stride, end, layout.num_unrollings)
            })
            .collect();

        let num_steps = if rows.len() < layout.batch_size * layout.num_unrollings {
            0
        } else {
            lanes.iter().map(Vec::len).max().unwrap_or(0)
        };

        let generator = Self {
            rows,
            layout: layout.clone(),
            lanes,
            num_steps,
            step: 0,
        };
        debug!(
            "loaded {} rows from {:?}: {} steps of {}x{}",
            generator.num_data_points(),
            path,
            generator.num_steps(),
            layout.batch_size,
            layout.num_unrollings
        );
        Ok(generator)
    }

    pub fn num_data_points(&self) -> usize {
        self.rows.len()
    }

    fn current_windows(&self) -> impl Iterator<Item = Option<Window>> + '_ {
        self.lanes.iter().map(move |windows| windows.get(self.step).copied())
    }
}

/// Cuts `rows[start..end]` into windows that never cross a key boundary.
fn lane_windows(rows: &[Row], start: usize, end: usize, num_unrollings: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let mut len = 1;
        while len < num_unrollings && cursor + len < end && rows[cursor + len].offset != 0 {
            len += 1;
        }
        windows.push(Window { start: cursor, len });
        cursor += len;
    }
    windows
}

fn io_error(path: &Path, source: std::io::Error) -> DataError {
    DataError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct Columns {
    key: usize,
    target: usize,
    inputs: Vec<usize>,
}

impl Columns {
    fn resolve(header: &[String], path: &Path, layout: &DataLayout) -> Result<Self, DataError> {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DataError::MissingColumn {
                    path: PathBuf::from(path),
                    column: name.to_string(),
                })
        };
        let key = find(&layout.key_name)?;
        let target = find(&layout.target_name)?;

        let candidates: Vec<usize> = (0..header.len())
            .filter(|&i| i != key && i != target)
            .collect();
        if candidates.len() < layout.num_inputs {
            return Err(DataError::TooFewInputs {
                path: path.to_path_buf(),
                found: candidates.len(),
                expected: layout.num_inputs,
            });
        }

        Ok(Self {
            key,
            target,
            inputs: candidates[..layout.num_inputs].to_vec(),
        })
    }
}

impl BatchSource for BatchGenerator {
    fn num_steps(&self) -> usize {
        self.num_steps
    }

    fn batch_size(&self) -> usize {
        self.layout.batch_size
    }

    fn num_unrollings(&self) -> usize {
        self.layout.num_unrollings
    }

    fn rewind_cursor(&mut self) {
        self.step = 0;
    }

    fn next_batch(&mut self) -> Batch {
        let DataLayout {
            num_inputs,
            batch_size,
            num_unrollings,
            ..
        } = self.layout;
        let mut inputs = vec![vec![0.0f32; batch_size * num_inputs]; num_unrollings];
        let mut targets = vec![vec![0i64; batch_size]; num_unrollings];
        let mut seq_lengths = Vec::with_capacity(batch_size);
        let mut reset_flags = Vec::with_capacity(batch_size);

        let first_window = self.step == 0;
        for (lane, window) in self.current_windows().enumerate() {
            let Some(Window { start, len }) = window else {
                seq_lengths.push(0);
                reset_flags.push(true);
                continue;
            };
            reset_flags.push(first_window || self.rows[start].offset == 0);

            for (t, row) in self.rows[start..start + len].iter().enumerate() {
                inputs[t][lane * num_inputs..(lane + 1) * num_inputs].copy_from_slice(&row.inputs);
                targets[t][lane] = row.target;
            }
            seq_lengths.push(len);
        }

        self.step += 1;
        if self.step >= self.num_steps {
            self.step = 0;
        }

        Batch {
            inputs,
            targets,
            seq_lengths,
            reset_flags,
        }
    }

    fn is_predata(&self, min_history: usize) -> bool {
        self.current_windows().all(|window| {
            window.map_or(true, |Window { start, .. }| self.rows[start].offset < min_history)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn layout(batch_size: usize, num_unrollings: usize) -> DataLayout {
        DataLayout {
            key_name: "key".to_string(),
            target_name: "y".to_string(),
            num_inputs: 2,
            num_outputs: 3,
            batch_size,
            num_unrollings,
        }
    }

    /// Two keys: `a` with 6 rows, `b` with 2 rows. Input `x1` is the row index.
    fn table() -> String {
        let mut text = String::from("key date x1 x2 y\n");
        for i in 0..8 {
            let key = if i < 6 { "a" } else { "b" };
            text.push_str(&format!("{} 2016{:02} {} {} {}\n", key, i, i, -i, i % 3));
        }
        text
    }

    fn generator(batch_size: usize, num_unrollings: usize) -> BatchGenerator {
        BatchGenerator::from_reader(
            Cursor::new(table()),
            Path::new("table.dat"),
            &layout(batch_size, num_unrollings),
        )
        .unwrap()
    }

    #[test]
    fn geometry_follows_row_count() {
        let g = generator(2, 2);
        assert_eq!(g.num_data_points(), 8);
        assert_eq!(g.num_steps(), 2);
        assert_eq!(generator(2, 5).num_steps(), 0);
    }

    #[test]
    fn inputs_skip_key_and_target_columns() {
        let mut g = generator(1, 2);
        let batch = g.next_batch();
        // Columns key and y are excluded; `date` is the first input column.
        assert_eq!(batch.inputs[0], vec![201600.0, 0.0]);
        assert_eq!(batch.inputs[1], vec![201601.0, 1.0]);
        assert_eq!(batch.targets, vec![vec![0], vec![1]]);
    }

    #[test]
    fn windows_stop_at_key_boundaries() {
        // Lane 0 reads rows 0..4, lane 1 rows 4..8.
        let mut g = generator(2, 3);
        assert_eq!(g.num_steps(), 2);
        let first = g.next_batch();
        assert_eq!(first.seq_lengths, vec![3, 2]);
        assert_eq!(first.reset_flags, vec![true, true]);
        // The padded step of lane 1 stays zero.
        assert_eq!(&first.inputs[2][2..4], &[0.0, 0.0]);

        let second = g.next_batch();
        // Lane 0 continues key `a`; lane 1 begins key `b`.
        assert_eq!(second.seq_lengths, vec![1, 2]);
        assert_eq!(second.reset_flags, vec![false, true]);

        // The second pass starts both lanes over at their first window.
        let third = g.next_batch();
        assert_eq!(third.reset_flags, vec![true, true]);
        assert_eq!(third.targets[0], vec![0, 1]);
    }

    /// `keys` sequences of `per_key` rows. Input `x1` is the row index.
    fn keyed_table(keys: usize, per_key: usize) -> String {
        let mut text = String::from("key x1 x2 y\n");
        for i in 0..keys * per_key {
            text.push_str(&format!("k{} {} 0 0\n", i / per_key, i));
        }
        text
    }

    fn rows_read(batches: &[Batch]) -> Vec<usize> {
        let mut rows: Vec<usize> = batches
            .iter()
            .flat_map(|batch| {
                batch.seq_lengths.iter().enumerate().flat_map(move |(lane, &len)| {
                    (0..len).map(move |t| batch.inputs[t][lane * 2] as usize)
                })
            })
            .collect();
        rows.sort_unstable();
        rows
    }

    #[test]
    fn one_pass_reads_every_row_once() {
        // Keys of 3 rows with windows of 2 take two steps per key.
        let mut g = BatchGenerator::from_reader(
            Cursor::new(keyed_table(10, 3)),
            Path::new("t.dat"),
            &layout(1, 2),
        )
        .unwrap();
        assert_eq!(g.num_steps(), 20);

        let pass: Vec<Batch> = (0..g.num_steps()).map(|_| g.next_batch()).collect();
        assert_eq!(rows_read(&pass), (0..30).collect::<Vec<_>>());

        g.next_batch();
        g.rewind_cursor();
        let again: Vec<Batch> = (0..g.num_steps()).map(|_| g.next_batch()).collect();
        assert_eq!(again, pass);
    }

    #[test]
    fn short_lanes_are_padded_until_the_pass_ends() {
        // 35 rows over 3 lanes: rows 0..11, 11..22 and 22..35.
        let mut g = BatchGenerator::from_reader(
            Cursor::new(keyed_table(5, 7)),
            Path::new("t.dat"),
            &layout(3, 4),
        )
        .unwrap();
        assert_eq!(g.num_steps(), 4);

        let pass: Vec<Batch> = (0..g.num_steps()).map(|_| g.next_batch()).collect();
        assert_eq!(rows_read(&pass), (0..35).collect::<Vec<_>>());
        assert_eq!(pass[0].seq_lengths, vec![4, 3, 4]);
        assert_eq!(pass[3].seq_lengths, vec![0, 1, 3]);
        assert!(pass[3].inputs.iter().all(|step| step[0..2] == [0.0, 0.0]));
        // Lane 1 starts in the middle of key k1 and still resets.
        assert_eq!(pass[0].reset_flags, vec![true, true, true]);
        assert_eq!(pass[1].reset_flags, vec![false, true, false]);
    }

    #[test]
    fn rewind_restarts_deterministically() {
        let mut g = generator(2, 2);
        let first: Vec<Batch> = (0..3).map(|_| g.next_batch()).collect();
        g.rewind_cursor();
        let second: Vec<Batch> = (0..3).map(|_| g.next_batch()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn predata_tracks_history_within_key() {
        let mut g = generator(1, 2);
        assert!(!g.is_predata(0));
        assert!(g.is_predata(1));
        g.next_batch();
        assert!(g.is_predata(3));
        assert!(!g.is_predata(2));
    }

    #[test]
    fn reports_missing_columns_and_bad_rows() {
        let missing = BatchGenerator::from_reader(
            Cursor::new("id x1 x2 y\nA 1 2 0\n"),
            Path::new("t.dat"),
            &layout(1, 1),
        );
        assert!(matches!(missing, Err(DataError::MissingColumn { .. })));

        let bad_target = BatchGenerator::from_reader(
            Cursor::new("key x1 x2 y\nA 1 2 7\n"),
            Path::new("t.dat"),
            &layout(1, 1),
        );
        assert!(matches!(bad_target, Err(DataError::Parse { line: 2, .. })));

        let short_row = BatchGenerator::from_reader(
            Cursor::new("key x1 x2 y\nA 1 0\n"),
            Path::new("t.dat"),
            &layout(1, 1),
        );
        assert!(matches!(short_row, Err(DataError::Parse { .. })));

        let empty = BatchGenerator::from_reader(
            Cursor::new("key x1 x2 y\n\n"),
            Path::new("t.dat"),
            &layout(1, 1),
        );
        assert!(matches!(empty, Err(DataError::Empty { .. })));
    }

    #[test]
    fn new_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.dat");
        std::fs::write(&path, table()).unwrap();
        let g = BatchGenerator::new(&path, &layout(2, 2)).unwrap();
        assert_eq!(g.num_data_points(), 8);

        let missing = BatchGenerator::new(dir.path().join("nope.dat"), &layout(2, 2));
        assert!(matches!(missing, Err(DataError::Io { .. })));
    }
}
