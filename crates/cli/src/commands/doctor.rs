//! `toolmux doctor`: diagnose configuration and credentials.

use std::path::Path;
use toolmux_config::{validate_peers, AppConfig, SEARCH_API_KEY_ENV};

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<u8> {
    println!("toolmux doctor");
    println!("==============\n");

    let path = config_path.map(Path::to_path_buf).unwrap_or_else(AppConfig::config_path);
    let mut issues = 0;

    if path.exists() {
        println!("  ✅ Config file found at {}", path.display());
    } else {
        println!("  ℹ️  No config file at {}, using defaults", path.display());
    }

    let config = match AppConfig::load_with_env(&path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  1 issue found.");
            return Ok(1);
        }
    };

    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", toolmux_providers::router::default_model(&config));

    if config.has_api_key() || config.default_provider == "ollama" {
        println!("  ✅ API key configured");
    } else {
        println!("  ❌ No API key: set OPENAI_API_KEY or TOOLMUX_API_KEY");
        issues += 1;
    }

    if config.has_search_key() {
        println!("  ✅ Search key configured");
    } else {
        println!("  ⚠️  {SEARCH_API_KEY_ENV} not set: the search peer will not start");
    }

    let peers = match std::env::current_exe() {
        Ok(exe) => config.resolve_peers(&exe),
        Err(e) => {
            println!("  ❌ Cannot locate the toolmux executable: {e}");
            return Ok(1);
        }
    };
    match validate_peers(&peers) {
        Ok(()) => {
            let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
            println!("  ✅ Peers: {}", names.join(", "));
        }
        Err(e) => {
            println!("  ❌ Peer set invalid: {e}");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed.");
        Ok(0)
    } else {
        println!("  {issues} issue(s) found. See above for details.");
        Ok(1)
    }
}
