//! Hand-rolled test client: sends one request to a running server and prints
//! the raw response. With `--image` it posts the file to `/predict`,
//! otherwise it fetches `/`.

use clap::{value_parser, Arg, Command};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const BOUNDARY: &str = "boneaged-client";

fn predict_request(image: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"image\"\r\n\r\n");
    body.extend_from_slice(image);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    let mut request = format!(
        "POST /predict HTTP/1.1\r\n\
         Host: boneaged\r\n\
         Connection: close\r\n\
         Content-Type: multipart/form-data; boundary={}\r\n\
         Content-Length: {}\r\n\r\n",
        BOUNDARY,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

fn main() -> ExitCode {
    let matches = Command::new("predict_client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sends a request to a running bone age server.")
        .arg(
            Arg::new("address")
                .long("address")
                .value_name("HOST:PORT")
                .default_value("127.0.0.1:8008"),
        )
        .arg(
            Arg::new("image")
                .long("image")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Image file to post to /predict; omit to fetch /"),
        )
        .get_matches();

    let address = matches.get_one::<String>("address").unwrap();

    let request = match matches.get_one::<PathBuf>("image") {
        Some(path) => match fs::read(path) {
            Ok(image) => predict_request(&image),
            Err(err) => {
                eprintln!("predict_client: {}: {}", path.display(), err);
                return ExitCode::FAILURE;
            }
        },
        None => b"GET / HTTP/1.1\r\nHost: boneaged\r\nConnection: close\r\n\r\n".to_vec(),
    };

    let mut stream = match TcpStream::connect(address) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("predict_client: connect {}: {}", address, err);
            return ExitCode::FAILURE;
        }
    };
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .expect("setting a read timeout cannot fail");

    if let Err(err) = stream.write_all(&request) {
        eprintln!("predict_client: send: {}", err);
        return ExitCode::FAILURE;
    }

    let mut response = Vec::new();
    if let Err(err) = stream.read_to_end(&mut response) {
        eprintln!("predict_client: receive: {}", err);
        return ExitCode::FAILURE;
    }

    print!("{}", String::from_utf8_lossy(&response));
    ExitCode::SUCCESS
}
