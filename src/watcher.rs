use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, RelayConfig};

const RELOAD_RETRIES: u32 = 3;

pub fn spawn(path: PathBuf, config: Arc<ArcSwap<RelayConfig>>) {
    // the watcher lives on a plain thread; its callbacks are synchronous
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, config) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, config: Arc<ArcSwap<RelayConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &config),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

fn reload(path: &Path, config: &ArcSwap<RelayConfig>) {
    // editors often truncate then write; retry a few times before giving up
    let mut retries = RELOAD_RETRIES;
    while retries > 0 {
        match config::load_config(path) {
            Ok(new_cfg) => {
                config.store(Arc::new(new_cfg));
                info!(target = "watcher", path = %path.display(), "config reloaded, applies to the next session");
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                } else {
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}
