// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Repeatable single-value flag
fn repeated(id: &'static str, short: char, value_name: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .short(short)
        .value_name(value_name)
        .action(ArgAction::Append)
        .help(help)
}

fn build_cli() -> Command {
    Command::new("dir2sif")
        .version(env!("CARGO_PKG_VERSION"))
        .author("dir2sif Contributors")
        .about("Add directories to a SIF image as a squashfs overlay partition")
        .arg(
            Arg::new("base")
                .short('b')
                .value_name("PATH")
                .required(true)
                .help("Path to the base SIF image"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .value_name("PATH")
                .required(true)
                .help("Output image"),
        )
        .arg(
            repeated("paths", 'p', "PATH", "Path to be added to the image (can be used multiple times)")
                .required(true),
        )
        .arg(repeated(
            "replacements",
            'r',
            "FIND:REPLACE",
            "Replacement prefix (can be used multiple times; first match wins)",
        ))
        .arg(repeated(
            "env",
            'e',
            "KEY=VALUE",
            "Environment variable to add to the image (can be used multiple times)",
        ))
        .arg(
            Arg::new("temp_dir")
                .short('t')
                .value_name("DIR")
                .help("Directory to temporarily place the squashfs file"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Fail instead of skipping entries that cannot be read while walking"),
        )
        .arg(
            Arg::new("sqfstar")
                .long("sqfstar")
                .value_name("PROGRAM")
                .env("DIR2SIF_SQFSTAR")
                .default_value("sqfstar")
                .help("sqfstar program to run"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
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

    let man_path = man_dir.join("dir2sif.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
