//! `porter status`: retained checkpoints of unfinished runs.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use porter::checkpoint::FileCheckpointStore;
use porter::config::PorterConfig;
use porter::metrics::MetricsDb;

pub fn cmd_status(workdir: PathBuf) -> Result<()> {
    let config = PorterConfig::new(workdir)?;
    let store = FileCheckpointStore::new(config.checkpoint_dir());
    let checkpoints = store.list()?;

    println!();
    println!("Porter Status");
    println!("=============");
    println!();

    if checkpoints.is_empty() {
        println!("No unfinished runs in {}", store.dir().display());
        println!();
        return Ok(());
    }

    // Run rows are optional decoration; a missing database is not an error.
    let db_path = config.metrics_db_path();
    let db = if db_path.exists() {
        MetricsDb::new(&db_path).ok()
    } else {
        None
    };

    for (path, checkpoint) in checkpoints {
        let checkpoint = match checkpoint {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                println!("{} {}", style("unreadable").red(), path.display());
                println!("    {}", e);
                println!();
                continue;
            }
        };

        println!("{}", style(&checkpoint.run_id).cyan().bold());
        if let Some(run) = db
            .as_ref()
            .and_then(|db| db.get_run(&checkpoint.run_id).ok().flatten())
        {
            println!(
                "    {} -> {} ({}), {}",
                run.project, run.target_language, run.strategy, run.status
            );
        }
        println!(
            "    Completed: {} unit(s){}",
            checkpoint.completed_unit_ids.len(),
            if checkpoint.completed_unit_ids.is_empty() {
                String::new()
            } else {
                format!(" ({})", checkpoint.completed_unit_ids.join(", "))
            }
        );
        if let Some(current) = &checkpoint.current_unit_id {
            println!("    Failed:    {}", current);
        }
        if let Some(failure) = &checkpoint.last_failure {
            println!(
                "    Failure:   {} in {}: {}",
                style(&failure.unit_id).red(),
                failure.phase,
                failure.message
            );
        }
        println!(
            "    Saved:     {}",
            checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("    File:      {}", path.display());
        println!();
    }
    Ok(())
}
