//! AVALON - Interactive Shell
//! Line-oriented front end over a string-keyed store.

use std::io::{self, BufRead, Write};
use std::sync::atomic::Ordering;

use avalon::{Avalon, Config};

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║           AVALON Storage Engine           ║");
    println!("  ║    AVL MemTable + Segment Store v0.1.0    ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    flush              - Retire the memtable to a segment");
    println!("    sync               - Wait for pending flushes");
    println!("    segments           - List segment files");
    println!("    info               - Show engine statistics");
    println!("    exit               - Shutdown engine");
    println!();

    let engine: Avalon<String, String> = match Avalon::open(Config::default()) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("avalon> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("[ERROR] Failed to read input: {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                match engine.put(parts[1].to_string(), parts[2..].join(" ")) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match engine.get(&parts[1].to_string()) {
                    Some(value) => println!("  \"{}\"", value),
                    None => println!("  (nil)"),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match engine.delete(parts[1].to_string()) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "flush" => match engine.flush() {
                Ok(()) => println!("  OK (memtable retired)"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "sync" => match engine.sync() {
                Ok(()) => println!("  OK ({} segments)", engine.segment_count()),
                Err(e) => println!("  ERROR: {}", e),
            },
            "segments" | "ls" => {
                let segments = engine.segments();
                if segments.is_empty() {
                    println!("  (no segments)");
                }
                for segment in &segments {
                    println!(
                        "  #{:<4} [{} .. {}] {} bytes",
                        segment.index(),
                        segment.min_key(),
                        segment.max_key(),
                        segment.file_size()
                    );
                }
            }
            "info" | "stats" => {
                let metrics = engine.metrics();
                println!("  MemTable:      {} live / {} nodes", engine.memtable_len(), engine.memtable_hidden_len());
                println!("  Pending:       {}", engine.pending_flushes());
                println!("  Segments:      {}", engine.segment_count());
                println!("  Flushed:       {} bytes", metrics.bytes_flushed.load(Ordering::Relaxed));
                println!("{}", metrics.report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down AVALON...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = engine.close() {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}
