pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod session;

use std::{env, path::Path};

mod util;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => {
                println!("Starting relay...");
                let config = args.get(2).map(Path::new);
                if let Err(e) = server::main(config) {
                    println!("Relay error:\n{:#}", e);
                    std::process::exit(1);
                }
            }
            _ => {
                print_usage();
            }
        }
    } else {
        print_usage();
    }
}

fn print_usage() {
    println!("Rover Relay");
    println!("Usage:");
    println!("  cargo run serve [config.toml]  - Start the signaling server and RTP relay");
    println!("  (see relay.example.toml for a config that launches the transcoders)");
}
