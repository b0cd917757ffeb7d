// Configuration loader
// Parses a TOML hyperparameter file into a validated HyperParams

use std::path::Path;

use crate::errors::ConfigError;

use super::settings::HyperParams;

/// Load and validate hyperparameters from a TOML file.
///
/// Unknown keys fail the parse (the settings struct denies them); missing
/// keys take documented defaults. Validation runs once here, so downstream
/// code can trust every value.
pub fn load_params(path: &Path) -> Result<HyperParams, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let params: HyperParams = toml::from_str(&contents).map_err(|e| ConfigError::Invalid {
        key: "config",
        reason: format!("{} is not a valid hyperparameter file: {e}", path.display()),
    })?;

    params.validate()?;

    tracing::debug!(
        backbone = %params.backbone,
        learning_rate = params.learning_rate,
        batch_size = params.batch_size,
        epochs = params.epochs,
        "Loaded hyperparameters"
    );

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeStrategy;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let (_dir, path) = write_config("");
        let params = load_params(&path).unwrap();
        assert_eq!(params, HyperParams::default());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let (_dir, path) = write_config(
            "learning_rate = 1e-4\ndecode_strategy = \"beam\"\nbeam_width = 8\n",
        );
        let params = load_params(&path).unwrap();
        assert_eq!(params.learning_rate, 1e-4);
        assert_eq!(params.decode_strategy, DecodeStrategy::Beam);
        assert_eq!(params.beam_width, 8);
        assert_eq!(params.epochs, HyperParams::default().epochs);
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let (_dir, path) = write_config("learning_rte = 1e-4\n");
        let err = load_params(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let (_dir, path) = write_config("batch_size = 0\n");
        let err = load_params(&path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_params(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
