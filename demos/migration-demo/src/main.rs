//! Migrates an in-memory `orders` table into an in-memory target, then
//! runs a consistency check and prints the three status tables.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p migration-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use tidewater_connectors::testing::{orders_table, MemoryDataSource};
use tidewater_connectors::DialectRegistry;
use tidewater_core::config::Properties;
use tidewater_job::{
    render_table, CheckEndpoint, InMemoryProgressStore, JobConfig, JobItemReceiver, JobManager,
    JobRepository, TableRef,
};
use tracing_subscriber::EnvFilter;

const ORDERS: i64 = 25_000;

/// Applies every record to `target` and acks it, until the inventory
/// sentinel arrives.
async fn import(mut item: JobItemReceiver, target: MemoryDataSource) -> Result<u64, String> {
    let mut applied = 0;
    loop {
        let batch = item.receiver.fetch(512, Duration::from_millis(50)).await;
        let mut finished = false;
        for record in &batch {
            match record.as_data() {
                Some(data) => {
                    target.apply(data).map_err(|e| e.to_string())?;
                    applied += 1;
                }
                None => finished = true,
            }
        }
        item.receiver.ack(&batch);
        if finished {
            tracing::info!(item = item.item, table = %item.table, applied, "Importer done");
            return Ok(applied);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let source = MemoryDataSource::new("ds_0");
    source.create_table(orders_table());
    source.insert_orders(1..=ORDERS);
    let target = MemoryDataSource::new("target_ds");
    target.create_table(orders_table());

    let manager = JobManager::new(JobRepository::new(Arc::new(InMemoryProgressStore::new())));
    manager.register_source(Arc::new(source.clone()), Arc::new(source.clone()));

    let config = JobConfig {
        job_id: "j0101".into(),
        data_source: "ds_0".into(),
        dialect: "mysql".into(),
        tables: vec![TableRef::new("orders")],
        sharding_node: Some("demo".into()),
        props: Properties::from_pairs([
            ("read.batch.size", "1000"),
            ("read.shard.size", "10000"),
            ("read.rate.limiter.type", "QPS"),
            ("read.rate.limiter.qps", "200"),
        ]),
    };
    let job_id = config.job_id.clone();
    let items = manager.start_job(config).await?;
    let importers: Vec<_> = items
        .into_iter()
        .map(|item| tokio::spawn(import(item, target.clone())))
        .collect();
    for importer in importers {
        importer.await??;
    }
    let status = manager.join_job(&job_id).await?;
    tracing::info!(job_id = %job_id, status = %status, rows = target.row_count("orders"), "Migration done");

    let endpoint = CheckEndpoint::new(
        Arc::new(target.clone()),
        Arc::new(target.clone()),
        DialectRegistry::with_defaults().resolve("mysql")?,
    );
    let check_job_id = manager.start_check(&job_id, "DATA_MATCH", Properties::new(), endpoint)?;
    manager.wait_check(&job_id).await?;
    tracing::info!(check_job_id = %check_job_id, "Consistency check done");

    println!("{}", render_table(&manager.list_jobs()));
    println!("{}", render_table(&manager.job_item_infos(&job_id)));
    println!("{}", render_table(&manager.consistency_check_infos(&job_id)));
    Ok(())
}
