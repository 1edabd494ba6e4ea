//! Slot Vault entry point
//!
//! On the web this boots a vault against LocalStorage/IndexedDB and wires
//! page lifecycle events. Natively it runs a short scripted session against
//! an in-memory store backed by snapshot files, so successive runs restore
//! from the previous run's backup.

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn wasm_main() {
    slot_vault::platform::web::init_logging();
    log::info!("Slot Vault starting...");
    match slot_vault::platform::web::start() {
        Some(vault) => log::info!("Slot Vault running on slot {}", vault.active_slot()),
        None => log::error!("No browser window, vault not started"),
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // WASM entry point is wasm_main, this is just to satisfy the compiler
}

#[cfg(not(target_arch = "wasm32"))]
#[derive(clap::Parser, Debug)]
#[command(author, version, about = "Scripted Slot Vault session backed by snapshot files", long_about = None)]
struct Cli {
    /// Directory holding the snapshot files
    #[arg(default_value = "snapshots")]
    dir: String,
    /// Overwrite a balance behind the vault's back and let verification catch it
    #[arg(long)]
    tamper: bool,
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    use std::rc::Rc;

    use clap::Parser;

    use slot_vault::persistence::NoProbe;
    use slot_vault::platform::snapshot_store::FileSnapshotStore;
    use slot_vault::platform::time::SystemClock;
    use slot_vault::platform::{KeyValueStore, ManualTimers, MemoryStorage};
    use slot_vault::{Amount, Currency, EventFilter, Lifecycle, Vault, VaultConfig, VaultPlatform};

    env_logger::init();

    let cli = Cli::parse();
    log::info!("Slot Vault (native) starting, snapshots in {}", cli.dir);

    let config = VaultConfig::load();
    let storage = MemoryStorage::new();
    let timers = ManualTimers::new();
    let platform = VaultPlatform {
        storage: Rc::new(storage.clone()),
        snapshots: Rc::new(FileSnapshotStore::new(&cli.dir)),
        timers: Rc::new(timers.clone()),
        clock: Rc::new(SystemClock::default()),
        probe: Rc::new(NoProbe),
    };

    let vault = Vault::new(config.clone(), platform);
    vault.subscribe(EventFilter::all(), |event| log::info!("{event:?}"));
    vault.boot();

    let coins = vault.currency(Currency::Coins);
    println!("Restored coins: {}", coins.get());

    coins.add(Amount::from(100u64));
    coins.multiply_multiplier(2.0);
    let earned = coins.apply_multiplier(&Amount::from(25u64));
    coins.add(earned);
    println!("Coins: {} (x{})", coins.get(), coins.multiplier());

    // Let the debounced backup fire
    timers.advance(f64::from(config.backup_debounce_ms));

    if cli.tamper {
        let key = coins.value_key();
        if let Err(e) = storage.set_item(&key, "999999999") {
            log::warn!("Tamper write failed: {e}");
        }
        timers.advance(f64::from(config.integrity_interval_ms));
    }
    println!("Slot {} modified: {}", vault.active_slot(), vault.is_modified(vault.active_slot()));

    vault.lifecycle(Lifecycle::PageHide);
    vault.shutdown();
    println!("Backups written: {}", vault.backup().flush_count());
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["slot-vault"]).unwrap();
        assert_eq!(cli.dir, "snapshots");
        assert!(!cli.tamper);
    }

    #[test]
    fn test_cli_tamper_flag_alone_keeps_default_dir() {
        let cli = Cli::try_parse_from(["slot-vault", "--tamper"]).unwrap();
        assert_eq!(cli.dir, "snapshots");
        assert!(cli.tamper);

        let cli = Cli::try_parse_from(["slot-vault", "--tamper", "saves"]).unwrap();
        assert_eq!(cli.dir, "saves");
        assert!(cli.tamper);
    }
}
