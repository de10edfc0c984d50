/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use knowstr_core::config::Config;
use knowstr_core::redis_store::RedisStore;
use knowstr_core::relay::{new_relay_fields, RelayId};
use knowstr_core::settings::Settings;
use knowstr_core::store::Store;
use knowstr_protocol::normalize_relay_url;

const USAGE: &str = "usage: knowstr_admin <command>
  add <url> [--active]
  activate <url>
  deactivate <url>
  always-on <url> on|off
  restart <url>
  clear-fails <url>
  idle on|off";

fn relay_arg(args: &[String]) -> Result<(String, RelayId)> {
    let raw = args.get(1).context(USAGE)?;
    let url = normalize_relay_url(raw).with_context(|| format!("not a relay url: {raw}"))?;
    let id = RelayId::from_url(&url);
    Ok((url, id))
}

fn switch_arg(args: &[String], index: usize) -> Result<bool> {
    match args.get(index).map(String::as_str) {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("warn".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let config = Config::from_env();
    let store = RedisStore::connect(&config.redis_url).await?;

    match command.as_str() {
        "add" => {
            let (url, id) = relay_arg(&args)?;
            let active = args.iter().any(|a| a == "--active");
            let settings = Settings::load(&store).await?;
            let fields = new_relay_fields(&url, &settings.relay_defaults);
            let active = active || settings.relay_defaults.is_active();
            if store.create_relay(&id, &fields, active).await? {
                println!("added {url} ({id})");
            } else {
                println!("already known: {url} ({id})");
                if active {
                    store.set_relay_active(&id, true).await?;
                    println!("activated {url}");
                }
            }
        }
        "activate" | "deactivate" => {
            let (url, id) = relay_arg(&args)?;
            let active = command == "activate";
            store.set_relay_active(&id, active).await?;
            println!("{command}d {url}");
        }
        "always-on" => {
            let (url, id) = relay_arg(&args)?;
            let on = switch_arg(&args, 2)?;
            store.set_relay_always_on(&id, on).await?;
            println!("always-on {} for {url}", if on { "set" } else { "cleared" });
        }
        "restart" => {
            let (url, id) = relay_arg(&args)?;
            store.request_restart(&[id]).await?;
            println!("restart requested for {url}");
        }
        "clear-fails" => {
            let (url, id) = relay_arg(&args)?;
            store.clear_failures(&id).await?;
            println!("fail counter cleared for {url}");
        }
        "idle" => {
            let on = switch_arg(&args, 1)?;
            store.set_idle(on).await?;
            println!("idle {}", if on { "on" } else { "off" });
        }
        other => bail!("unknown command {other}\n{USAGE}"),
    }
    Ok(())
}
