//! Purpose: Hold top-level CLI command dispatch for `gatehost`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command opens only the backends it touches (kv commands never dial messaging).
//! Invariants: One tokio runtime per invocation; it is dropped before the process exits.

use std::sync::Arc;

use gatehost::hosting::{InstanceInfo, InstanceManager, MemoryServerRegistry};
use gatehost::kv::{Bucket, KvClient, Operation, WatchEvent, get_json};
use gatehost::rpc::{EventBus, Request, RpcType, TransferPlayerRequest, TransferPlayerResponse};

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    config: HostingConfig,
) -> Result<RunOutcome, Error> {
    if let Command::Completion { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::aot::generate(shell, &mut cmd, "gatehost", &mut io::stdout());
        return Ok(RunOutcome::ok());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(run_command(command, config))
}

async fn run_command(command: Command, config: HostingConfig) -> Result<RunOutcome, Error> {
    match command {
        Command::Kv { command } => run_kv(command, &config).await,
        Command::Instances { command } => run_instances(command, &config).await,
        Command::Rpc { command } => run_rpc(command, &config).await,
        Command::Completion { .. } => Ok(RunOutcome::ok()),
    }
}

async fn open_kv(config: &HostingConfig) -> Result<Arc<dyn KvClient>, Error> {
    let storage = config.build_storage()?;
    config.build_kv(storage).await
}

async fn run_kv(command: KvCommand, config: &HostingConfig) -> Result<RunOutcome, Error> {
    let kv = open_kv(config).await?;
    match command {
        KvCommand::Get { bucket, key } => {
            let handle = kv.bucket(&bucket).await?;
            let value = handle.get(&key).await?;
            let (rendered, encoding) = value_json(&value);
            emit_json(json!({
                "bucket": bucket,
                "key": key,
                "value": rendered,
                "encoding": encoding,
            }));
        }
        KvCommand::Set { bucket, key, value } => {
            let handle = kv.bucket(&bucket).await?;
            let len = value.len();
            handle.set(&key, Bytes::from(value)).await?;
            emit_json(json!({ "bucket": bucket, "key": key, "len": len }));
        }
        KvCommand::Delete { bucket, key } => {
            let handle = kv.bucket(&bucket).await?;
            handle.delete(&key).await?;
            emit_json(json!({ "bucket": bucket, "key": key, "deleted": true }));
        }
        KvCommand::Keys { bucket } => {
            let handle = kv.bucket(&bucket).await?;
            let keys = handle.list_keys().await?;
            emit_json(json!({ "bucket": bucket, "keys": keys }));
        }
        KvCommand::Watch {
            bucket,
            until_replayed,
        } => {
            let handle = kv.bucket(&bucket).await?;
            watch_bucket(handle.as_ref(), until_replayed).await?;
        }
    }
    Ok(RunOutcome::ok())
}

async fn watch_bucket(bucket: &dyn Bucket, until_replayed: bool) -> Result<(), Error> {
    let mut watcher = bucket.watch_all().await?;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = watcher.next() => event?,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            WatchEvent::Replayed => {
                emit_jsonl(json!({
                    "bucket": bucket.name(),
                    "event": "replayed",
                    "observed_at": now_rfc3339()?,
                }));
                if until_replayed {
                    break;
                }
            }
            WatchEvent::Change(change) => {
                let mut line = Map::new();
                line.insert("bucket".to_string(), json!(bucket.name()));
                let event = match change.operation {
                    Operation::Put => "put",
                    Operation::Delete => "delete",
                };
                line.insert("event".to_string(), json!(event));
                line.insert("key".to_string(), json!(change.key));
                if let Some(value) = &change.value {
                    let (rendered, encoding) = value_json(value);
                    line.insert("value".to_string(), rendered);
                    line.insert("encoding".to_string(), json!(encoding));
                }
                line.insert("observed_at".to_string(), json!(now_rfc3339()?));
                emit_jsonl(Value::Object(line));
            }
        }
    }
    watcher.unwatch();
    Ok(())
}

fn instance_json(name: &str, info: &InstanceInfo) -> Value {
    json!({
        "name": name,
        "gamemode": info.gamemode,
        "address": info.address,
        "port": info.port,
    })
}

async fn run_instances(
    command: InstancesCommand,
    config: &HostingConfig,
) -> Result<RunOutcome, Error> {
    let kv = open_kv(config).await?;
    let bucket = kv.bucket(&config.pod.instances_bucket()).await?;
    let manager = InstanceManager::new(bucket, Arc::new(MemoryServerRegistry::new()));
    match command {
        InstancesCommand::Announce {
            name,
            gamemode,
            address,
            port,
        } => {
            let info = InstanceInfo::new(gamemode, address, port);
            manager.announce(&name, &info).await?;
            emit_json(instance_json(&name, &info));
        }
        InstancesCommand::Retire { name } => {
            manager.retire(&name).await?;
            emit_json(json!({ "name": name, "retired": true }));
        }
        InstancesCommand::List { gamemode } => {
            let bucket = manager.bucket();
            let mut instances = Vec::new();
            for name in bucket.list_keys().await? {
                let info: InstanceInfo = match get_json(bucket.as_ref(), &name).await {
                    Ok(info) => info,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) if err.kind() == ErrorKind::Corrupt => {
                        tracing::warn!(instance = %name, %err, "skipping malformed instance descriptor");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                if gamemode.as_deref().is_some_and(|wanted| wanted != info.gamemode) {
                    continue;
                }
                instances.push(instance_json(&name, &info));
            }
            emit_json(json!({
                "bucket": bucket.name(),
                "instances": instances,
            }));
        }
    }
    manager.shutdown().await?;
    Ok(RunOutcome::ok())
}

async fn run_rpc(command: RpcCommand, config: &HostingConfig) -> Result<RunOutcome, Error> {
    match command {
        RpcCommand::Transfer {
            uuid,
            source,
            destination,
            timeout_ms,
        } => {
            let timeout = timeout_from_ms(timeout_ms)?;
            let messenger = config.build_messaging().await?;
            let bus = EventBus::new(messenger, config.pod.network_subject()).await?;
            let payload = TransferPlayerRequest {
                uuid,
                source,
                destination,
            };
            let request = Request::new(RpcType::TRANSFER_PLAYER, &payload)?;
            let response = bus.request(&request, timeout).await?;
            let decoded: TransferPlayerResponse = response.decode()?;
            emit_json(json!({
                "subject": bus.subject(),
                "request": payload,
                "response": decoded,
            }));
        }
    }
    Ok(RunOutcome::ok())
}
