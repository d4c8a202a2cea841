// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Argument that also reads an `UPDATE_ENGINE_*` environment variable
fn env_arg(id: &'static str, long: &'static str, env_name: &'static str, help: &'static str) -> Arg {
    Arg::new(id).long(long).env(env_name).help(help)
}

fn build_cli() -> Command {
    Command::new("update-engine")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Update Engine Contributors")
        .about("A/B slot over-the-air update engine")
        .arg(
            Arg::new("url")
                .env("UPDATE_ENGINE_URL")
                .default_value("auto")
                .help("Bundle URL, local bundle path, or `auto` for the automatic update URL"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose logging and a terminal progress bar"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .env("UPDATE_ENGINE_CONFIG")
                .value_name("PATH")
                .help("Configuration file"),
        )
        .arg(env_arg(
            "base_url",
            "base-url",
            "UPDATE_ENGINE_BASE_URL",
            "Base URL for automatic updates",
        ))
        .arg(env_arg(
            "ankidev_base_url",
            "ankidev-base-url",
            "UPDATE_ENGINE_ANKIDEV_BASE_URL",
            "Base URL for automatic updates on development devices",
        ))
        .arg(env_arg(
            "ota_type",
            "ota-type",
            "UPDATE_ENGINE_OTA_TYPE",
            "Bundle flavor in the automatic update URL (default: diff)",
        ))
        .arg(env_arg(
            "use_sharding",
            "use-sharding",
            "UPDATE_ENGINE_USE_SHARDING",
            "Insert a per-device shard into the automatic update URL",
        ))
        .arg(env_arg(
            "shard",
            "shard",
            "UPDATE_ENGINE_SHARD",
            "Fixed shard instead of one derived from the serial number",
        ))
        .arg(env_arg(
            "allow_downgrade",
            "allow-downgrade",
            "UPDATE_ENGINE_ALLOW_DOWNGRADE",
            "Permit downgrades on development devices when version policy is on",
        ))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("update-engine.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
