//! Send a single result packet to a fuzz-collector server.
//!
//! Handy for checking a deployment by hand:
//!
//! ```text
//! fuzz-send 127.0.0.1 1337 42 0
//! fuzz-send 127.0.0.1 1337 7 11 --header XXXX
//! ```

use clap::Parser;
use fuzz_collector::packet::{encode_with_header, HEADER};
use std::net::IpAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "fuzz-send")]
#[command(about = "Send one test run result to a fuzz-collector server", long_about = None)]
struct Args {
    /// Server address
    host: IpAddr,

    /// Server port
    port: u16,

    /// Test run identifier
    test_run: u64,

    /// Outcome signal (0 = success)
    signal: u8,

    /// Override the 4-byte packet header
    #[arg(long, value_parser = parse_header)]
    header: Option<[u8; 4]>,
}

fn parse_header(s: &str) -> Result<[u8; 4], String> {
    s.as_bytes()
        .try_into()
        .map_err(|_| format!("header must be exactly 4 bytes, got {}", s.len()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let header = args.header.unwrap_or(*HEADER);
    let payload = encode_with_header(&header, args.test_run, args.signal);

    println!("Connecting...");
    let mut stream = TcpStream::connect((args.host, args.port)).await?;
    println!("Connected!");

    println!("Sending {:?}...", payload);
    stream.write_all(&payload).await?;
    stream.shutdown().await?;

    Ok(())
}
