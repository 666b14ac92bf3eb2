//! Timestamped copies of trained models and reports.

use std::path::{Path, PathBuf};

use burnwatch_classifier::{BEST_MODEL_FILE, FINAL_MODEL_FILE, METRICS_FILE};
use burnwatch_shared::{BurnwatchError, PathsConfig, Result};
use chrono::NaiveDateTime;

/// `<stem>_<YYYYmmdd_HHMMSS><ext>` for `path`.
pub fn backup_name(path: &Path, at: NaiveDateTime) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{stem}_{}{ext}", at.format("%Y%m%d_%H%M%S"))
}

/// Copy the final and best models, the predictions CSV and the metrics
/// report into `backup_dir`. Artifacts that do not exist yet are skipped.
///
/// Returns the backup paths written.
pub fn backup_artifacts(paths: &PathsConfig, at: NaiveDateTime) -> Result<Vec<PathBuf>> {
    let candidates = [
        paths.models_dir.join(FINAL_MODEL_FILE),
        paths.models_dir.join(BEST_MODEL_FILE),
        paths.predictions_csv(),
        paths.reports_dir.join(METRICS_FILE),
    ];

    std::fs::create_dir_all(&paths.backup_dir)
        .map_err(|e| BurnwatchError::io(&paths.backup_dir, e))?;

    let mut written = Vec::new();
    for src in candidates.iter().filter(|p| p.is_file()) {
        let dest = paths.backup_dir.join(backup_name(src, at));
        std::fs::copy(src, &dest).map_err(|e| BurnwatchError::io(src, e))?;
        tracing::debug!(src = %src.display(), dest = %dest.display(), "backed up");
        written.push(dest);
    }

    tracing::info!(count = written.len(), dir = %paths.backup_dir.display(), "backup complete");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap()
    }

    #[test]
    fn names_carry_timestamp_before_extension() {
        assert_eq!(
            backup_name(Path::new("models/final_model.safetensors"), at()),
            "final_model_20250307_140509.safetensors"
        );
        assert_eq!(backup_name(Path::new("NOTES"), at()), "NOTES_20250307_140509");
    }

    #[test]
    fn copies_only_existing_artifacts() {
        let root = std::env::temp_dir().join(format!("burnwatch_backup_{}", Uuid::now_v7()));
        let paths = PathsConfig {
            models_dir: root.join("models"),
            reports_dir: root.join("reports"),
            backup_dir: root.join("backups"),
            ..PathsConfig::default()
        };
        std::fs::create_dir_all(&paths.models_dir).unwrap();
        std::fs::create_dir_all(&paths.reports_dir).unwrap();
        std::fs::write(paths.models_dir.join(FINAL_MODEL_FILE), b"weights").unwrap();
        std::fs::write(paths.predictions_csv(), "path,prob,pred\n").unwrap();

        let written = backup_artifacts(&paths, at()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(paths
            .backup_dir
            .join("final_model_20250307_140509.safetensors")
            .is_file());
        assert!(paths
            .backup_dir
            .join("burn_predictions_20250307_140509.csv")
            .is_file());

        let _ = std::fs::remove_dir_all(&root);
    }
}
