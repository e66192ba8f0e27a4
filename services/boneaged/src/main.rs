use atlas::logging::{self, Level};
use boneaged::app::HttpApplication;
use boneaged::config::Config;
use boneaged::inference::{model, Dispatcher};
use clap::{value_parser, Arg, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("boneaged")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs the bone age inference server.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Read options from a TOML file"),
        )
        .arg(
            Arg::new("ip")
                .long("ip")
                .value_name("ADDR")
                .help("IP address the server listens on"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Port the server listens on"),
        )
        .arg(
            Arg::new("io-threads")
                .long("io-threads")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Number of I/O loop threads"),
        )
        .arg(
            Arg::new("infer-threads")
                .long("infer-threads")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Number of inference workers"),
        )
        .arg(
            Arg::new("static-dir")
                .long("static-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Root directory of the static file cache"),
        )
        .arg(
            Arg::new("yolo-model")
                .long("yolo-model")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the detection model"),
        )
        .arg(
            Arg::new("cls-model")
                .long("cls-model")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the classification model"),
        )
        .arg(
            Arg::new("log-path")
                .long("log-path")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for log files (stderr when absent)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(value_parser!(Level))
                .help("One of trace, debug, info, warn, error, critical, off"),
        )
}

fn load_config(matches: &clap::ArgMatches) -> Result<Config, String> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::load(path)
            .map_err(|err| format!("config file {}: {}", path.display(), err))?,
        None => Config::default(),
    };

    if let Some(ip) = matches.get_one::<String>("ip") {
        config.server_ip = ip.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(count) = matches.get_one::<usize>("io-threads") {
        config.num_io_threads = *count;
    }
    if let Some(count) = matches.get_one::<usize>("infer-threads") {
        config.num_infer_threads = *count;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("static-dir") {
        config.static_root_path = dir.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("yolo-model") {
        config.yolo_model_path = path.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("cls-model") {
        config.cls_model_path = path.clone();
    }
    if let Some(dir) = matches.get_one::<PathBuf>("log-path") {
        config.log_path = Some(dir.clone());
    }
    if let Some(level) = matches.get_one::<Level>("log-level") {
        config.log_level = *level;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("boneaged: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let log = match logging::init(config.log_level, config.log_path.as_deref()) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("boneaged: logger setup failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    logging::info!(log, "configuration loaded";
                   "ip" => &config.server_ip,
                   "port" => config.port,
                   "io_threads" => config.num_io_threads,
                   "infer_threads" => config.num_infer_threads,
                   "static_root" => config.static_root_path.display().to_string(),
                   "yolo_model" => config.yolo_model_path.display().to_string(),
                   "cls_model" => config.cls_model_path.display().to_string(),
                   "log_level" => config.log_level.as_str());

    let model = match model::load(&config.yolo_model_path, &config.cls_model_path, &log) {
        Ok(model) => model,
        Err(err) => {
            logging::crit!(log, "model initialization failed"; "error" => %err);
            return ExitCode::FAILURE;
        }
    };
    let dispatcher = Dispatcher::start(config.num_infer_threads, model, &log);
    logging::info!(log, "inference dispatcher started";
                   "workers" => config.num_infer_threads);

    let mut app = match HttpApplication::new(&config, Arc::clone(&dispatcher), &log) {
        Ok(app) => app,
        Err(err) => {
            logging::crit!(log, "server startup failed"; "error" => %err);
            return ExitCode::FAILURE;
        }
    };

    logging::info!(log, "server listening";
                   "addr" => app.listen_addr().map(|a| a.to_string()).unwrap_or_default());
    app.start();

    dispatcher.shutdown();
    ExitCode::SUCCESS
}
