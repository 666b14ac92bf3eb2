//! CSV tables: ground-truth labels (`path,label`) and predictions (`path,prob,pred`).

use std::path::{Path, PathBuf};

use burnwatch_shared::{BurnwatchError, LabelRecord, PredictionRecord, Result};
use serde::Deserialize;

/// Labels row as written by hand: either field may be blank.
#[derive(Debug, Deserialize)]
struct RawLabelRow {
    path: Option<String>,
    label: Option<String>,
}

fn csv_err(path: &Path, e: csv::Error) -> BurnwatchError {
    BurnwatchError::validation(format!("{}: {e}", path.display()))
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    let file = std::fs::File::open(path).map_err(|e| BurnwatchError::io(path, e))?;
    Ok(csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file))
}

fn require_columns(
    rdr: &mut csv::Reader<std::fs::File>,
    path: &Path,
    columns: &[&str],
) -> Result<()> {
    let headers = rdr.headers().map_err(|e| csv_err(path, e))?;
    for column in columns {
        if !headers.iter().any(|h| h == *column) {
            return Err(BurnwatchError::validation(format!(
                "{} is missing the '{column}' column",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Parse a 0/1 label, accepting `1`, `1.0`, and the like.
fn parse_label(raw: &str) -> Option<u8> {
    match raw.parse::<f64>().ok()? {
        v if v == 0.0 => Some(0),
        v if v == 1.0 => Some(1),
        _ => None,
    }
}

/// Read the labels table. Comment lines and rows with a blank field are skipped.
pub fn read_labels(path: &Path) -> Result<Vec<LabelRecord>> {
    let mut rdr = reader(path)?;
    require_columns(&mut rdr, path, &["path", "label"])?;

    let mut records = Vec::new();
    let mut dropped = 0usize;
    for (i, row) in rdr.deserialize::<RawLabelRow>().enumerate() {
        let row = row.map_err(|e| csv_err(path, e))?;
        let (Some(file), Some(label)) = (
            row.path.filter(|p| !p.is_empty()),
            row.label.filter(|l| !l.is_empty()),
        ) else {
            dropped += 1;
            continue;
        };

        let label = parse_label(&label).ok_or_else(|| {
            BurnwatchError::validation(format!(
                "{} row {}: label '{label}' is not 0 or 1",
                path.display(),
                i + 2
            ))
        })?;
        records.push(LabelRecord { path: file, label });
    }

    if dropped > 0 {
        tracing::warn!(path = %path.display(), dropped, "dropped label rows with empty fields");
    }
    Ok(records)
}

/// Read a predictions table.
pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRecord>> {
    let mut rdr = reader(path)?;
    require_columns(&mut rdr, path, &["path", "prob", "pred"])?;

    rdr.deserialize::<PredictionRecord>()
        .map(|row| row.map_err(|e| csv_err(path, e)))
        .collect()
}

/// Write a predictions table, creating the parent directory.
pub fn write_predictions(path: &Path, rows: &[PredictionRecord]) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_err(path, e))?;
    if rows.is_empty() {
        wtr.write_record(["path", "prob", "pred"])
            .map_err(|e| csv_err(path, e))?;
    }
    for row in rows {
        wtr.serialize(row).map_err(|e| csv_err(path, e))?;
    }
    wtr.flush().map_err(|e| BurnwatchError::io(path, e))?;
    Ok(())
}

/// Write a labels template listing every `*_ndvi.tif` in `index_dir` with label 0.
///
/// Returns the number of rows written.
pub fn write_label_template(index_dir: &Path, labels_csv: &Path) -> Result<usize> {
    let mut rasters: Vec<PathBuf> = match std::fs::read_dir(index_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with("_ndvi.tif"))
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(BurnwatchError::io(index_dir, e)),
    };
    rasters.sort();

    ensure_parent(labels_csv)?;
    let mut wtr = csv::Writer::from_path(labels_csv).map_err(|e| csv_err(labels_csv, e))?;
    wtr.write_record(["path", "label"])
        .map_err(|e| csv_err(labels_csv, e))?;
    for raster in &rasters {
        let path = raster.to_string_lossy().replace('\\', "/");
        wtr.write_record([path.as_str(), "0"])
            .map_err(|e| csv_err(labels_csv, e))?;
    }
    wtr.flush().map_err(|e| BurnwatchError::io(labels_csv, e))?;

    tracing::info!(path = %labels_csv.display(), rows = rasters.len(), "wrote labels template");
    Ok(rasters.len())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| BurnwatchError::io(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("burnwatch_tables_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn labels_skip_comments_and_blank_fields() {
        let dir = temp_dir();
        let path = dir.join("labels.csv");
        std::fs::write(
            &path,
            "path,label\n# reviewed 2024-09\ndata/ndvi/t1_ndvi.tif,1\n,0\ndata/ndvi/t2_ndvi.tif,\nt3_ndvi.tif, 0.0\n",
        )
        .unwrap();

        let labels = read_labels(&path).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, 1);
        assert_eq!(labels[1].path, "t3_ndvi.tif");
        assert_eq!(labels[1].label, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn non_binary_label_is_rejected() {
        let dir = temp_dir();
        let path = dir.join("labels.csv");
        std::fs::write(&path, "path,label\nt1_ndvi.tif,2\n").unwrap();
        let err = read_labels(&path).unwrap_err();
        assert!(err.to_string().contains("not 0 or 1"));

        std::fs::write(&path, "file,label\nt1_ndvi.tif,1\n").unwrap();
        assert!(read_labels(&path).unwrap_err().to_string().contains("'path'"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn predictions_table_roundtrip() {
        let dir = temp_dir();
        let path = dir.join("reports").join("burn_predictions.csv");
        let rows = vec![
            PredictionRecord::new("data/ndvi/t1_ndvi.tif", 0.75, 0.5),
            PredictionRecord::new("data/ndvi/t2_ndvi.tif", 0.25, 0.5),
        ];
        write_predictions(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("path,prob,pred\n"));
        assert_eq!(read_predictions(&path).unwrap(), rows);

        write_predictions(&path, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "path,prob,pred\n");
        assert!(read_predictions(&path).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn template_lists_index_rasters_only() {
        let dir = temp_dir();
        let ndvi = dir.join("ndvi");
        std::fs::create_dir_all(&ndvi).unwrap();
        for name in ["tile_0001_ndvi.tif", "tile_0000_ndvi.tif", "tile_0000.tif"] {
            std::fs::write(ndvi.join(name), b"").unwrap();
        }
        let labels_csv = dir.join("labels").join("labels.csv");

        assert_eq!(write_label_template(&ndvi, &labels_csv).unwrap(), 2);
        let labels = read_labels(&labels_csv).unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels[0].path.ends_with("tile_0000_ndvi.tif"));
        assert!(labels.iter().all(|l| l.label == 0));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
