// CLI integration tests over filesystem-backed storage; nothing here needs a broker.
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

fn cmd(data_dir: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_gatehost");
    let mut command = Command::new(exe);
    command.args([
        "--storage",
        "fs",
        "--storage-options",
        &json!({ "folder": data_dir }).to_string(),
    ]);
    command
}

fn run(data_dir: &Path, args: &[&str]) -> Output {
    cmd(data_dir).args(args).output().expect("spawn gatehost")
}

fn parse_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

fn parse_json_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

#[test]
fn kv_set_get_keys_delete_flow() {
    let temp = tempfile::tempdir().expect("tempdir");

    let set = run(temp.path(), &["kv", "set", "perms", "alice", "admin"]);
    assert!(set.status.success(), "{}", String::from_utf8_lossy(&set.stderr));
    let set_json = parse_json(&set.stdout);
    assert_eq!(set_json["len"], 5);

    let get = run(temp.path(), &["kv", "get", "perms", "alice"]);
    assert!(get.status.success());
    let get_json = parse_json(&get.stdout);
    assert_eq!(get_json["value"], "admin");
    assert_eq!(get_json["encoding"], "utf8");

    run(temp.path(), &["kv", "set", "perms", "bob", "guest"]);
    let keys = run(temp.path(), &["kv", "keys", "perms"]);
    assert!(keys.status.success());
    assert_eq!(parse_json(&keys.stdout)["keys"], json!(["alice", "bob"]));

    let delete = run(temp.path(), &["kv", "delete", "perms", "alice"]);
    assert!(delete.status.success());
    assert_eq!(parse_json(&delete.stdout)["deleted"], true);

    let document: Value = serde_json::from_slice(
        &std::fs::read(temp.path().join("kv.json")).expect("document"),
    )
    .expect("document json");
    assert_eq!(document["perms"]["name"], "perms");
    assert_eq!(document["perms"]["data"], json!({ "bob": "Z3Vlc3Q=" }));
}

#[test]
fn missing_key_exits_with_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let get = run(temp.path(), &["kv", "get", "perms", "nobody"]);
    assert_eq!(get.status.code(), Some(3));
    let err = parse_json(&get.stderr);
    assert_eq!(err["error"]["kind"], "NotFound");
    assert_eq!(err["error"]["key"], "nobody");

    let delete = run(temp.path(), &["kv", "delete", "perms", "nobody"]);
    assert_eq!(delete.status.code(), Some(3));
}

#[test]
fn unknown_backend_is_a_usage_error() {
    let exe = env!("CARGO_BIN_EXE_gatehost");
    let output = Command::new(exe)
        .args(["--kv", "redis", "kv", "keys", "perms"])
        .output()
        .expect("spawn gatehost");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(
        err["error"]["message"]
            .as_str()
            .expect("message")
            .contains("redis")
    );
}

#[test]
fn malformed_options_are_a_usage_error() {
    let exe = env!("CARGO_BIN_EXE_gatehost");
    let output = Command::new(exe)
        .args(["--storage", "fs", "--storage-options", "{", "kv", "keys", "perms"])
        .output()
        .expect("spawn gatehost");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn watch_until_replayed_prints_current_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    run(temp.path(), &["kv", "set", "perms", "alice", "admin"]);

    let watch = run(temp.path(), &["kv", "watch", "perms", "--until-replayed"]);
    assert!(watch.status.success());
    let lines = parse_json_lines(&watch.stdout);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event"], "put");
    assert_eq!(lines[0]["key"], "alice");
    assert_eq!(lines[0]["value"], "admin");
    assert_eq!(lines[1]["event"], "replayed");
}

#[test]
fn instances_announce_list_retire_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = [
        ("lobby-0", "lobby", "25565"),
        ("lobby-1", "lobby", "25566"),
        ("arena-0", "arena", "25567"),
    ];
    for (name, gamemode, port) in fleet {
        let announce = run(
            temp.path(),
            &[
                "instances",
                "announce",
                name,
                "--gamemode",
                gamemode,
                "--address",
                "127.0.0.1",
                "--port",
                port,
            ],
        );
        assert!(
            announce.status.success(),
            "{}",
            String::from_utf8_lossy(&announce.stderr)
        );
    }

    let list = run(temp.path(), &["instances", "list", "--gamemode", "lobby"]);
    assert!(list.status.success());
    let list_json = parse_json(&list.stdout);
    assert_eq!(list_json["bucket"], "gatehost_default_default_instances");
    let names: Vec<&str> = list_json["instances"]
        .as_array()
        .expect("instances")
        .iter()
        .map(|instance| instance["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, vec!["lobby-0", "lobby-1"]);

    let retire = run(temp.path(), &["instances", "retire", "lobby-0"]);
    assert!(retire.status.success());
    let list = run(temp.path(), &["instances", "list"]);
    let all = parse_json(&list.stdout)["instances"].clone();
    assert_eq!(all.as_array().expect("instances").len(), 2);

    let scoped = run(
        temp.path(),
        &["--network", "eu", "--namespace", "prod", "instances", "list"],
    );
    let scoped_json = parse_json(&scoped.stdout);
    assert_eq!(scoped_json["bucket"], "gatehost_prod_eu_instances");
    assert_eq!(scoped_json["instances"], json!([]));
}

#[test]
fn rpc_transfer_times_out_without_peers() {
    let exe = env!("CARGO_BIN_EXE_gatehost");
    let output = Command::new(exe)
        .args([
            "--messaging",
            "memory",
            "rpc",
            "transfer",
            "--uuid",
            "6f1c0a4e-31c3-4c59-9d55-0c2a6b5f3a10",
            "--source",
            "proxy-0",
            "--destination",
            "lobby",
            "--timeout-ms",
            "100",
        ])
        .output()
        .expect("spawn gatehost");
    assert_eq!(output.status.code(), Some(12));
    assert_eq!(parse_json(&output.stderr)["error"]["kind"], "Timeout");
}
