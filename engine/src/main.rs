// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use engine::bptree::Key;
use engine::config::EngineConfig;
use engine::index::{ClusteredIndex, IndexError};
use engine::storage::PagedStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: data_file={}, tree_width={}, value_size={}",
        config.data_file.display(),
        config.tree_width,
        config.value_size
    );

    if let Some(parent) = config.data_file.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create data directory: {e}");
            std::process::exit(1);
        }
    }

    let index = match ClusteredIndex::open(&config.data_file, config.tree_width, config.value_size)
    {
        Ok(index) => index,
        Err(e) => {
            tracing::error!("Failed to open index: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&index, config.value_size) {
        tracing::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

/// Load a batch of users, then look up, update and delete a few of them.
fn run(index: &ClusteredIndex<PagedStore>, row_size: usize) -> Result<(), IndexError> {
    for id in 1..30 {
        let text = format!("userName-{id},User-{id}@gmail.com");
        let Some(row) = encode_row(&text, row_size) else {
            tracing::warn!("user {id} does not fit in {row_size}-byte rows, skipped");
            continue;
        };
        match index.insert(id, row) {
            Ok(()) => {}
            Err(IndexError::DuplicateKey(id)) => tracing::info!("user {id} already stored"),
            Err(e) => return Err(e),
        }
    }

    show_tree(index)?;
    print_row(index, 27)?;

    if let Some(row) = encode_row("newName222,NewEmail111", row_size) {
        index.update(27, row)?;
    } else {
        tracing::warn!("update of user 27 does not fit in {row_size}-byte rows");
    }
    print_row(index, 27)?;

    index.delete(27)?;
    for id in 1..25 {
        index.delete(id)?;
    }

    println!("------");
    show_tree(index)?;
    println!("******");

    for row in index.rows()? {
        let (id, bytes) = row?;
        println!("{id}: {}", decode_row(&bytes));
    }

    index.tree().sync()?;
    Ok(())
}

fn show_tree(index: &ClusteredIndex<PagedStore>) -> Result<(), IndexError> {
    let snapshot = index.tree().get_data()?;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!("Failed to render tree snapshot: {e}"),
    }
    Ok(())
}

fn print_row(index: &ClusteredIndex<PagedStore>, id: Key) -> Result<(), IndexError> {
    match index.get(id)? {
        Some(bytes) => println!("{id}: {}", decode_row(&bytes)),
        None => println!("{id}: <missing>"),
    }
    Ok(())
}

/// Fit text into a fixed-size, zero-padded row, or `None` if it is too long.
fn encode_row(text: &str, row_size: usize) -> Option<Vec<u8>> {
    if text.len() > row_size {
        return None;
    }
    let mut row = text.as_bytes().to_vec();
    row.resize(row_size, 0);
    Some(row)
}

fn decode_row(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
