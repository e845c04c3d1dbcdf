//! Interactive index shell.
//!
//! A line-based loop over an in-memory index, for poking at tree behavior
//! with small fanouts:
//!
//! ```text
//! insert <key> <value>
//! find <key>
//! delete <key>
//! scan
//! tree
//! end
//! ```

use std::io::{BufRead, Write};
use std::sync::Arc;

use stratum_buffer::{BufferPoolConfig, BufferPoolManager, MemoryDiskManager};
use stratum_common::key::{CompoundKey, DefaultComparator};
use stratum_storage::{create_header_page, BPlusTreeOptions, LocalBPlusTree};

type Key = CompoundKey<8>;
type Tree = LocalBPlusTree<Key, u64, DefaultComparator>;

fn prompt(leaf_max: &mut u32, internal_max: &mut u32) {
    let stdin = std::io::stdin();
    print!("maximum leaf page size [4]: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);
    if let Ok(n) = line.trim().parse() {
        *leaf_max = n;
    }
    print!("maximum internal page size [4]: ");
    let _ = std::io::stdout().flush();
    line.clear();
    let _ = stdin.lock().read_line(&mut line);
    if let Ok(n) = line.trim().parse() {
        *internal_max = n;
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let (mut leaf_max, mut internal_max) = (4u32, 4u32);
    prompt(&mut leaf_max, &mut internal_max);

    let pool = Arc::new(BufferPoolManager::new(
        BufferPoolConfig {
            pool_size: 64,
            replacer_k: 2,
        },
        Arc::new(MemoryDiskManager::new()),
    ));
    create_header_page(&pool).expect("header page");
    let tree = Tree::new(
        pool,
        DefaultComparator,
        BPlusTreeOptions::named("repl").with_max_sizes(leaf_max, internal_max),
    )
    .expect("tree");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let mut parts = line.split_whitespace();
        let result = match (parts.next(), parts.next(), parts.next()) {
            (Some("insert"), Some(k), v) => {
                let Ok(k) = k.parse::<u64>() else {
                    eprintln!("bad key");
                    continue;
                };
                let v = v.and_then(|v| v.parse().ok()).unwrap_or(k);
                tree.insert(&Key::from_u64(k), &v).map(|ok| {
                    if !ok {
                        println!("duplicate key {}", k);
                    }
                })
            }
            (Some("find"), Some(k), _) => {
                let Ok(k) = k.parse::<u64>() else {
                    eprintln!("bad key");
                    continue;
                };
                tree.get_value(&Key::from_u64(k)).map(|values| {
                    match values.first() {
                        Some(v) => println!("{} -> {}", k, v),
                        None => println!("{} not found", k),
                    }
                })
            }
            (Some("delete"), Some(k), _) => {
                let Ok(k) = k.parse::<u64>() else {
                    eprintln!("bad key");
                    continue;
                };
                tree.remove(&Key::from_u64(k)).map(|ok| {
                    if !ok {
                        println!("{} not found", k);
                    }
                })
            }
            (Some("scan"), _, _) => tree.begin().map(|iter| {
                let keys: Vec<String> =
                    iter.map(|(k, v)| format!("{}:{}", k.as_u64(), v)).collect();
                println!("[{}]", keys.join(" "));
            }),
            (Some("tree"), _, _) => tree.render().map(|s| print!("{}", s)),
            (Some("end"), _, _) => break,
            (None, _, _) => continue,
            (Some(cmd), _, _) => {
                eprintln!("unknown command: {}", cmd);
                continue;
            }
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
    }
}
