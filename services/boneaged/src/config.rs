use atlas::logging::Level;
use serde_derive::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration. Defaults are overridden by the TOML config file,
/// which in turn is overridden by CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server_ip: String,
    pub port: u16,
    pub num_io_threads: usize,
    pub num_infer_threads: usize,
    pub static_root_path: PathBuf,
    pub yolo_model_path: PathBuf,
    pub cls_model_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server_ip: "0.0.0.0".to_string(),
            port: 8008,
            num_io_threads: 4,
            num_infer_threads: 2,
            static_root_path: PathBuf::from("static"),
            yolo_model_path: PathBuf::from("models/detect.onnx"),
            cls_model_path: PathBuf::from("models/classify.onnx"),
            log_path: None,
            log_level: Level::Info,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }
}
