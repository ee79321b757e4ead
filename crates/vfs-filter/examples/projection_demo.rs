//! Example: drive the dispatcher against an in-memory backing store.
//!
//! Usage:
//!   cargo run -p rusty-projection-filter --example projection_demo -- [options]
//!
//! Options:
//!   --state-dir <path>    Journal path states under this directory
//!   --scratch-dir <path>  Keep local content under this directory
//!   --config <file>       Load FilterOptions from a JSON file
//!
//! Set `RUST_LOG=debug` to watch every transition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusty_projection_filter::{
    AccessMask, DeleteDisposition, Destination, Dispatcher, EnumerationReply, FilterError,
    FilterOptions, HandleId, OpenOptions,
};
use rusty_projection_vfs::{MemoryBackingStore, VirtualPath};
use tracing_subscriber::EnvFilter;

/// Parsed command line.
struct DemoArgs {
    state_dir: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl DemoArgs {
    /// Parse command line arguments.
    ///
    /// # Returns
    /// Parsed CLI arguments or None if help was requested or args invalid.
    fn parse() -> Option<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = DemoArgs {
            state_dir: None,
            scratch_dir: None,
            config: None,
        };

        let mut i: usize = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--state-dir" => {
                    i += 1;
                    parsed.state_dir = Some(PathBuf::from(args.get(i)?));
                }
                "--scratch-dir" => {
                    i += 1;
                    parsed.scratch_dir = Some(PathBuf::from(args.get(i)?));
                }
                "--config" => {
                    i += 1;
                    parsed.config = Some(PathBuf::from(args.get(i)?));
                }
                _ => {
                    eprintln!("Usage: {} [--state-dir <path>] [--scratch-dir <path>] [--config <file>]", args[0]);
                    return None;
                }
            }
            i += 1;
        }
        Some(parsed)
    }

    fn options(&self) -> Result<FilterOptions, FilterError> {
        let mut options: FilterOptions = match &self.config {
            Some(file) => FilterOptions::from_json_file(file)?,
            None => FilterOptions::default(),
        };
        if let Some(dir) = &self.state_dir {
            options = options.with_state_dir(dir.clone());
        }
        if let Some(dir) = &self.scratch_dir {
            options = options.with_scratch_dir(dir.clone());
        }
        Ok(options)
    }
}

fn path(p: &str) -> Result<VirtualPath, Box<dyn std::error::Error>> {
    Ok(VirtualPath::new(p)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(args) = DemoArgs::parse() else {
        std::process::exit(1);
    };

    let backing = Arc::new(MemoryBackingStore::new());
    backing.insert_file("README.md", b"# Projected repository\n");
    backing.insert_file("src/main.rs", b"fn main() {\n    println!(\"hello\");\n}\n");
    backing.insert_file("src/lib.rs", b"pub mod util;\n");
    backing.insert_file("src/util.rs", b"pub fn answer() -> u32 { 42 }\n");
    backing.insert_file("docs/guide.md", b"Read the source.\n");

    let dispatcher = Dispatcher::new(args.options()?, backing.clone())?;

    // List the root.
    let root: HandleId = dispatcher.on_create(&VirtualPath::root(), OpenOptions::dir())?;
    let listing: EnumerationReply = dispatcher.on_enumerate(root, true, 4096, None)?;
    for entry in &listing.entries {
        println!(
            "{:<12} {:>6} {}",
            entry.name,
            entry.size,
            if entry.is_directory { "<dir>" } else { "" }
        );
    }
    dispatcher.on_close(root)?;

    // Read a file: placeholder on open, full content on first read.
    let main_rs: HandleId = dispatcher.on_create(&path("src/main.rs")?, OpenOptions::read())?;
    let content: Vec<u8> = dispatcher.on_read(main_rs, 0, 4096)?;
    println!("src/main.rs:\n{}", String::from_utf8_lossy(&content));
    dispatcher.on_close(main_rs)?;

    // Create, edit and rename a local file.
    let notes: HandleId = dispatcher.on_create(&path("notes.txt")?, OpenOptions::create_file())?;
    dispatcher.on_write(notes, 0, b"local only\n")?;
    dispatcher.on_close(notes)?;

    let rename: OpenOptions = OpenOptions::read().with_access(AccessMask::READ.with_delete());
    let notes: HandleId = dispatcher.on_create(&path("notes.txt")?, rename.clone())?;
    dispatcher.on_rename(notes, &Destination::Inside(path("docs/notes.txt")?), false)?;
    dispatcher.on_close(notes)?;

    // Move a projected directory; its placeholders keep their identity.
    let src: HandleId = dispatcher.on_create(&path("src")?, rename.clone())?;
    dispatcher.on_rename(src, &Destination::Inside(path("lib")?), false)?;
    dispatcher.on_close(src)?;

    // Delete a projected file.
    let guide: HandleId = dispatcher.on_create(&path("docs/guide.md")?, rename)?;
    dispatcher.on_delete(guide, DeleteDisposition::SetDisposition)?;
    dispatcher.on_close(guide)?;

    dispatcher.wait_for_notifications(Duration::from_secs(5));
    dispatcher.compact()?;
    println!("{}", dispatcher.stats().display_grid());
    Ok(())
}
