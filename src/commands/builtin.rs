// Built-in commands of the administrative channel.

use std::sync::Arc;
use std::time::Duration;

use crate::logger::LogLevel;

use super::protocol::CommandError;
use super::server::{CommandServer, ServerConn};

const BUILTINS: [&str; 7] = ["help", "ping", "server", "proc", "task", "log", "watch"];

const WATCH_POLL: Duration = Duration::from_millis(500);

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub(crate) async fn dispatch(
    server: &Arc<CommandServer>,
    conn: &mut ServerConn,
    cmd: &str,
    args: &[String],
) -> Result<i32, CommandError> {
    match cmd {
        "help" => help(server, conn).await,
        "ping" => ping(conn).await,
        "server" => server_cmd(conn, args).await,
        "proc" => proc_cmd(conn, args).await,
        "task" => task_cmd(conn, args).await,
        "log" => log_cmd(conn, args).await,
        "watch" => watch_cmd(conn).await,
        _ => Err(CommandError::standard(format!("unknown command '{}'", cmd))),
    }
}

async fn help(server: &Arc<CommandServer>, conn: &mut ServerConn) -> Result<i32, CommandError> {
    conn.write_out("available commands:").await?;
    conn.write_out("  help                                     this text").await?;
    conn.write_out("  ping                                     health probe, replies 'pong'").await?;
    conn.write_out("  server <port> online|offline <m>|extend <m>  website availability").await?;
    conn.write_out("  proc list|start|stop|restart|kill [name] supervised processes").await?;
    conn.write_out("  task list|exec|kill|set-timer [args]     background tasks").await?;
    conn.write_out("  log [level ...|tags ...|range from to]   query in-memory logs").await?;
    conn.write_out("  watch                                    tail logs, any input stops").await?;
    let registered = server.command_names();
    if !registered.is_empty() {
        conn.write_out("registered commands:").await?;
        for name in registered {
            conn.write_out(format!("  {}", name)).await?;
        }
    }
    Ok(0)
}

async fn ping(conn: &mut ServerConn) -> Result<i32, CommandError> {
    conn.write_out("pong").await?;
    Ok(0)
}

fn parse_minutes(arg: Option<&String>) -> Result<i64, CommandError> {
    arg.ok_or_else(|| CommandError::standard("missing minutes argument"))?
        .parse::<i64>()
        .map_err(|_| CommandError::standard("minutes must be an integer"))
}

async fn server_cmd(conn: &mut ServerConn, args: &[String]) -> Result<i32, CommandError> {
    let usage = "usage: server <port> online|offline <minutes>|extend <minutes>";
    let port: u16 = args
        .first()
        .ok_or_else(|| CommandError::standard(usage))?
        .parse()
        .map_err(|_| CommandError::standard("port must be an integer"))?;

    let router = conn.router().clone();
    let Some(http) = router.http_server(port) else {
        return Err(CommandError::standard(format!("no http server on port {}", port)));
    };
    let handler = http.handler().clone();

    match args.get(1).map(String::as_str) {
        Some("online") => {
            handler.set_online();
            conn.write_out(format!("server {} online", port)).await?;
        }
        Some("offline") => {
            let minutes = parse_minutes(args.get(2))?;
            handler.set_offline_for(minutes);
            conn.write_out(format!("server {} offline for {}m", port, minutes)).await?;
        }
        Some("extend") => {
            let minutes = parse_minutes(args.get(2))?;
            handler.extend_offline(minutes);
            conn.write_out(format!("server {} offline extended by {}m", port, minutes)).await?;
        }
        Some("cache") => {
            return Err(CommandError::standard(
                "cache controls are not available on this build",
            ));
        }
        _ => return Err(CommandError::standard(usage)),
    }
    Ok(0)
}

async fn proc_cmd(conn: &mut ServerConn, args: &[String]) -> Result<i32, CommandError> {
    let usage = "usage: proc list|start <name>|stop <name>|restart <name>|kill <name>";
    let router = conn.router().clone();
    let tm = router.task_manager().clone();

    let sub = args.first().map(String::as_str);
    let name = args.get(1).cloned();
    let named = |name: Option<String>| -> Result<String, CommandError> {
        name.ok_or_else(|| CommandError::standard("missing process name"))
    };

    match sub {
        Some("list") => {
            for n in tm.process_names() {
                let running = tm.is_process_running(&n).unwrap_or(false);
                let state = if running { "running" } else { "stopped" };
                let pid = tm
                    .process_pid(&n)
                    .ok()
                    .flatten()
                    .map(|p| format!(" pid {}", p))
                    .unwrap_or_default();
                conn.write_out(format!("{} [{}{}]", n, state, pid)).await?;
            }
        }
        Some("start") => {
            let n = named(name)?;
            tm.start_process(&n).map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("process '{}' started", n)).await?;
        }
        Some("stop") => {
            let n = named(name)?;
            tm.stop_process(&n).map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("process '{}' stopping", n)).await?;
        }
        Some("restart") => {
            let n = named(name)?;
            tm.restart_process(&n)
                .await
                .map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("process '{}' restarted", n)).await?;
        }
        Some("kill") => {
            let n = named(name)?;
            tm.kill_process(&n).map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("process '{}' killed", n)).await?;
        }
        _ => return Err(CommandError::standard(usage)),
    }
    Ok(0)
}

async fn task_cmd(conn: &mut ServerConn, args: &[String]) -> Result<i32, CommandError> {
    let usage = "usage: task list|exec <name>|kill <name>|set-timer <name> <10s|1m|10m|30m|1h|inactive>";
    let router = conn.router().clone();
    let tm = router.task_manager().clone();

    match args.first().map(String::as_str) {
        Some("list") => {
            for n in tm.task_names() {
                if let Ok(t) = tm.get_task(&n) {
                    let state = if t.is_running() { "running" } else { "idle" };
                    conn.write_out(format!("{} [{} timer {}]", n, state, t.timer().as_str()))
                        .await?;
                }
            }
        }
        Some("exec") => {
            let n = args.get(1).ok_or_else(|| CommandError::standard("missing task name"))?;
            tm.exec_task(n).await.map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("task '{}' dispatched", n)).await?;
        }
        Some("kill") => {
            let n = args.get(1).ok_or_else(|| CommandError::standard("missing task name"))?;
            tm.kill_task(n).map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("task '{}' killed", n)).await?;
        }
        Some("set-timer") => {
            let n = args.get(1).ok_or_else(|| CommandError::standard("missing task name"))?;
            let timer = args
                .get(2)
                .and_then(|t| crate::tasks::TaskTimer::parse(t))
                .ok_or_else(|| CommandError::standard("invalid timer value"))?;
            tm.set_task_timer(n, timer)
                .map_err(|e| CommandError::standard(e.to_string()))?;
            conn.write_out(format!("task '{}' timer set to {}", n, timer.as_str())).await?;
        }
        _ => return Err(CommandError::standard(usage)),
    }
    Ok(0)
}

async fn log_cmd(conn: &mut ServerConn, args: &[String]) -> Result<i32, CommandError> {
    let router = conn.router().clone();
    let logger = router.logger().clone();

    let logs = match args.first().map(String::as_str) {
        None => {
            // Tail of the ring by default.
            let all = logger.logs();
            let skip = all.len().saturating_sub(100);
            all.into_iter().skip(skip).collect()
        }
        Some("level") => {
            let levels: Vec<LogLevel> = args[1..]
                .iter()
                .filter_map(|s| LogLevel::parse(s))
                .collect();
            if levels.is_empty() {
                return Err(CommandError::standard("no valid levels given"));
            }
            logger.logs_at(&levels)
        }
        Some("tags") => {
            let tags: Vec<&str> = args[1..].iter().map(String::as_str).collect();
            if tags.is_empty() {
                return Err(CommandError::standard("no tags given"));
            }
            logger.logs_tagged(&tags)
        }
        Some("range") => {
            let from: u64 = args
                .get(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CommandError::standard("range needs numeric bounds"))?;
            let to: u64 = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CommandError::standard("range needs numeric bounds"))?;
            logger.logs_in_range(from, to)
        }
        Some(_) => {
            return Err(CommandError::standard(
                "usage: log [level <lvl...>|tags <tag...>|range <from> <to>]",
            ))
        }
    };

    for log in logs {
        conn.write_out(log.line()).await?;
    }
    Ok(0)
}

async fn watch_cmd(conn: &mut ServerConn) -> Result<i32, CommandError> {
    let router = conn.router().clone();
    let logger = router.logger().clone();
    let mut last_id = logger.logs().last().map(|l| l.id);

    loop {
        match tokio::time::timeout(WATCH_POLL, conn.read_line()).await {
            // Any stdin line, EOF or a read error stops the tail.
            Ok(Ok(_) | Err(_)) => return Ok(0),
            Err(_) => {
                for log in logger.logs_after(last_id) {
                    last_id = Some(log.id);
                    conn.write_out(log.line()).await?;
                }
            }
        }
    }
}
