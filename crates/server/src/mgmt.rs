//! Management command surface.
//!
//! A line-oriented admin channel on the loopback management port.
//! Commands are space-separated words; replies are SMTP-style
//! `<code> <message>` lines, with `code-` continuation lines for
//! multi-line output. All state changes are delegated to the data core.

use std::net::SocketAddr;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use benchnet_common::check;
use benchnet_common::conf::parse_u64_auto;
use benchnet_proto::JobSpec;

use crate::data::{DataHandle, Job, Node};

const HELP: &str = "commands:
commit
    commit changes to database
h|help
    help
job <id> <period> <start> <capacity> <times> <check>...
    add job
list
    list nodes and jobs
node <id> <capacity> <geoloc> [<key>]
    add node
quit
    quit
rmjob <id>
    remove job
rmnode <id>
    remove node
sched
    run scheduler and commit changes to database";

pub async fn handle(socket: TcpStream, peer: SocketAddr, data: DataHandle) {
    match serve(socket, &data).await {
        Ok(()) => info!("management {peer}: connection completed"),
        Err(e) => warn!("management {peer}: connection terminated: {e}"),
    }
}

async fn serve(socket: TcpStream, data: &DataHandle) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    respond(&mut write_half, 220, "benchnet-management-0 hello").await?;
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };
        let args: Vec<&str> = words.collect();
        let (code, msg) = dispatch(cmd, &args, data).await;
        respond(&mut write_half, code, &msg).await?;
        if code == 221 {
            break;
        }
    }
    Ok(())
}

/// Writes `msg` under `code`, using `code-` continuation lines for all
/// but the last line.
async fn respond<W: AsyncWrite + Unpin>(w: &mut W, code: u16, msg: &str) -> std::io::Result<()> {
    let mut lines = msg.lines().peekable();
    let mut out = String::new();
    loop {
        let Some(line) = lines.next() else { break };
        let sep = if lines.peek().is_some() { '-' } else { ' ' };
        out.push_str(&format!("{code}{sep}{line}\r\n"));
    }
    if msg.is_empty() {
        out = format!("{code} \r\n");
    }
    w.write_all(out.as_bytes()).await?;
    w.flush().await
}

async fn dispatch(cmd: &str, args: &[&str], data: &DataHandle) -> (u16, String) {
    match cmd {
        "h" | "help" => require_no_args(args, || (214, HELP.to_string())),
        "job" => add_job(args, data).await,
        "rmjob" => rm_job(args, data).await,
        "node" => add_node(args, data).await,
        "rmnode" => rm_node(args, data).await,
        "list" => match args {
            [] => (210, list(data).await),
            _ => (501, "invalid syntax".into()),
        },
        "sched" => require_no_args(args, || {
            data.request_schedule();
            (210, "ok".into())
        }),
        "commit" => require_no_args(args, || {
            data.request_commit();
            (210, "ok".into())
        }),
        "quit" => require_no_args(args, || (221, "bye".into())),
        _ => (500, "unknown command".into()),
    }
}

fn require_no_args(args: &[&str], f: impl FnOnce() -> (u16, String)) -> (u16, String) {
    if args.is_empty() {
        f()
    } else {
        (501, "invalid syntax".into())
    }
}

fn num(arg: &str) -> Result<u64, (u16, String)> {
    parse_u64_auto(arg).ok_or_else(|| (501, format!("{arg}: invalid number")))
}

fn num32(arg: &str) -> Result<u32, (u16, String)> {
    num(arg)?
        .try_into()
        .map_err(|_| (501, format!("{arg}: out of range")))
}

async fn add_job(args: &[&str], data: &DataHandle) -> (u16, String) {
    if args.len() < 6 {
        return (501, "invalid syntax".into());
    }
    let parsed = (|| {
        Ok::<_, (u16, String)>((
            num(args[0])?,
            num32(args[1])?,
            num32(args[2])?,
            num32(args[3])?,
            num(args[4])? as usize,
        ))
    })();
    let (id, period, start, capa, want) = match parsed {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tokens: Vec<String> = args[5..].iter().map(|s| s.to_string()).collect();
    if let Err(e) = check::parse(&tokens) {
        return (501, format!("{}: {e}", tokens.join(" ")));
    }
    if data.get_job(id).await.is_some() {
        return (550, "job already exists".into());
    }
    data.add_job(Job {
        spec: JobSpec { id, period, start, check: tokens },
        capa,
        want,
        nodes: vec![],
    })
    .await;
    (200, "ok".into())
}

async fn rm_job(args: &[&str], data: &DataHandle) -> (u16, String) {
    let [arg] = args else {
        return (501, "invalid syntax".into());
    };
    let id = match num(arg) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if data.get_job(id).await.is_none() {
        return (550, "job does not exist".into());
    }
    data.rm_job(id).await;
    (200, "ok".into())
}

async fn add_node(args: &[&str], data: &DataHandle) -> (u16, String) {
    if args.len() < 3 || args.len() > 4 {
        return (501, "invalid syntax".into());
    }
    let parsed = (|| Ok::<_, (u16, String)>((num(args[0])?, num32(args[1])?, num(args[2])?)))();
    let (id, capa, loc) = match parsed {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut key = [0u8; 32];
    match args.get(3) {
        Some(hexkey) => {
            if hexkey.len() != 64 || hex::decode_to_slice(hexkey, &mut key).is_err() {
                return (501, format!("{hexkey}: must be 64 hexadecimal digits"));
            }
        }
        None => OsRng.fill_bytes(&mut key),
    }
    if data.get_node(id).await.is_some() {
        return (550, "node already exists".into());
    }
    data.add_node(Node {
        id,
        last_seen: 0,
        capa,
        used: 0,
        loc,
        key,
        jobs: vec![],
    })
    .await;
    (200, "ok".into())
}

async fn rm_node(args: &[&str], data: &DataHandle) -> (u16, String) {
    let [arg] = args else {
        return (501, "invalid syntax".into());
    };
    let id = match num(arg) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if data.get_node(id).await.is_none() {
        return (550, "node does not exist".into());
    }
    data.rm_node(id).await;
    (200, "ok".into())
}

async fn list(data: &DataHandle) -> String {
    let (nodes, jobs) = data.list().await;
    let mut out = String::new();
    for n in &nodes {
        out.push_str(&n.to_string());
        out.push_str("\n\n");
    }
    for j in &jobs {
        out.push_str(&j.to_string());
        out.push_str("\n\n");
    }
    let trimmed = out.trim_end().to_string();
    if trimmed.is_empty() {
        "empty".into()
    } else {
        trimmed
    }
}
