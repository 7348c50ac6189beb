//! Minimal live MP3 relay
//!
//! Run with: cargo run --example mp3_relay [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example mp3_relay                  # binds to 127.0.0.1:8000
//!   cargo run --example mp3_relay 0.0.0.0:8000     # binds to 0.0.0.0:8000
//!
//! ## Feeding the relay
//!
//! The relay reads MP3 from a FIFO at /tmp/mp3_relay.fifo:
//!
//!   mkfifo /tmp/mp3_relay.fifo
//!   ffmpeg -re -i music.mp3 -c copy -f mp3 /tmp/mp3_relay.fifo
//!
//! or straight from a sound card:
//!
//!   arecord -f cd | lame -r - - > /tmp/mp3_relay.fifo
//!
//! ## Listening
//!
//!   mpv http://localhost:8000/
//!   curl http://localhost:8000/ | mpg123 -
//!
//! Every listener gets the same live stream; a stalled listener skips
//! forward instead of pausing anyone else.

use streamtap::{Config, StreamServer};

const FIFO: &str = "/tmp/mp3_relay.fifo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let bind_addr = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:8000".into());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("streamtap=info".parse()?),
        )
        .init();

    let config = Config::default()
        .addr(bind_addr.clone())
        .path(FIFO)
        .frame_bytes(4096)
        .frame_filter("mp3")
        .source_buffer(32)
        .close_idle(true);

    println!("Relaying {} on http://{}/", FIFO, bind_addr);
    println!();
    println!("=== Feed it ===");
    println!("mkfifo {}", FIFO);
    println!("ffmpeg -re -i music.mp3 -c copy -f mp3 {}", FIFO);
    println!();
    println!("=== Listen ===");
    println!("mpv http://{}/", bind_addr);
    println!();

    let server = StreamServer::new(config)?;

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                eprintln!("Server error: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            server.close();
        }
    }

    Ok(())
}
