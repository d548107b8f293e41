use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use walbox_config::WalboxConfig;
use walbox_pg::{format_lsn, PostgresOutboxStore};

enum Level {
    Ok,
    Warn,
    Fail,
}

fn report(level: Level, label: &str, detail: &str) {
    let mark: ColoredString = match level {
        Level::Ok => "✓".green(),
        Level::Warn => "!".yellow(),
        Level::Fail => "✗".red(),
    };
    println!("  {} {:<18} {}", mark, label, detail);
}

pub async fn cmd_check(config: WalboxConfig) -> Result<()> {
    let params = config.connection_params()?;
    println!("\n{} {}\n", "Checking".bold(), params);

    let store = PostgresOutboxStore::connect(&config)
        .await
        .context("Failed to connect to Postgres")?;
    let status = store.server_status().await?;
    let capabilities = store.probe_capabilities().await?;

    let logical = status.logical_replication_enabled();
    report(
        if logical { Level::Ok } else { Level::Fail },
        "wal_level",
        &status.wal_level,
    );

    if status.publication_exists {
        report(Level::Ok, "publication", &config.outbox.publication);
    } else {
        report(
            Level::Warn,
            "publication",
            &format!("{} missing, created on run", config.outbox.publication),
        );
    }

    if capabilities.has_sent_column {
        report(Level::Ok, "sent column", &config.outbox_table());
    } else {
        report(
            Level::Warn,
            "sent column",
            &format!("{} has none, reconciler disabled", config.outbox_table()),
        );
    }

    if status.heartbeat_table_exists {
        report(Level::Ok, "heartbeat table", &config.outbox.heartbeat_table);
    } else {
        report(
            Level::Warn,
            "heartbeat table",
            &format!("{} missing, created on run", config.outbox.heartbeat_table),
        );
    }

    report(Level::Ok, "wal position", &format_lsn(status.current_wal_lsn));
    println!();

    if !logical {
        anyhow::bail!("wal_level must be 'logical' (currently '{}')", status.wal_level);
    }

    println!("{}", "Ready to stream.".green().bold());
    Ok(())
}
