use std::sync::Arc;

use chrono::{DateTime, Utc};
use teloxide::{prelude::*, types::ParseMode};

use repost_core::{
    cache::TargetChat,
    domain::MessageId,
    locator::Existence,
    scheduler::Mode,
    state::ForwardState,
    stats::{CycleResult, Statistics},
};

use crate::router::AppState;

const HELP: &str = "\
<b>Channel re-post bot</b>\n\
\n\
/start — arm the forwarding scheduler\n\
/stop — disarm it\n\
/pause — pause without losing state\n\
/resume — resume after a pause\n\
/status — scheduler mode, candidate id, failures\n\
/forwardnow — run one forwarding cycle immediately\n\
/getlast — show the stored candidate message id\n\
/setlast &lt;id&gt; — override the candidate id\n\
/test &lt;id&gt; — check whether a channel message still exists\n\
/findlast — scan backwards for the newest surviving message\n\
/chats — list known target chats\n\
/stats — totals and recent cycle history";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}

fn status_html(mode: Mode, state: &ForwardState, active: usize, total: usize) -> String {
    format!(
        "\u{1f4e1} <b>Status</b>\n\
         Mode: {mode}\n\
         Candidate id: {}\n\
         Last forwarded: {}\n\
         Consecutive failures: {}\n\
         Targets: {active} active / {total} known",
        state.last_message_id,
        format_time(state.last_forwarded_at),
        state.consecutive_failures,
    )
}

fn cycle_summary_html(result: &CycleResult) -> String {
    format!(
        "\u{2705} Cycle done: message {} \u{2192} {} sent, {} failed, {} skipped",
        result.candidate,
        result.sent(),
        result.failed(),
        result.skipped(),
    )
}

fn chats_html(targets: &[TargetChat]) -> String {
    if targets.is_empty() {
        return "No target chats yet. Add the bot to a group.".to_string();
    }

    let mut lines = vec![format!("\u{1f4cb} <b>Target chats ({})</b>", targets.len())];
    for t in targets {
        let marker = if t.is_active { "\u{2705}" } else { "\u{26d4}" };
        lines.push(format!(
            "{marker} {} (<code>{}</code>)",
            escape_html(&t.title),
            t.chat_id
        ));
    }
    lines.join("\n")
}

fn stats_html(totals: Statistics, recent: &[CycleResult]) -> String {
    let mut lines = vec![format!(
        "\u{1f4ca} <b>Statistics</b>\n\
         Cycles: {}\n\
         Sent: {}\n\
         Failed: {}",
        totals.uptime_cycles, totals.total_sent, totals.total_failed,
    )];

    if !recent.is_empty() {
        lines.push("\n<b>Recent cycles</b>".to_string());
        for r in recent {
            lines.push(format!(
                "\u{2022} {} — msg {}: {} sent, {} failed",
                r.finished_at.format("%H:%M:%S"),
                r.candidate,
                r.sent(),
                r.failed(),
            ));
        }
    }
    lines.join("\n")
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let (cmd, args) = parse_command(msg.text().unwrap_or(""));

    let reply = match cmd.as_str() {
        "start" => {
            state.scheduler.start().await;
            format!(
                "\u{25b6} Forwarding armed: every {}s from {}.\nUse /status to check progress.",
                state.cfg.tick_interval.as_secs(),
                escape_html(&state.cfg.source_channel.to_string()),
            )
        }
        "help" => HELP.to_string(),
        "status" => {
            let fs = state.scheduler.forward_state().await;
            let mode = state.scheduler.mode().await;
            let targets = state.cache.snapshot().await;
            let active = targets.iter().filter(|t| t.is_active).count();
            status_html(mode, &fs, active, targets.len())
        }
        "pause" => {
            state.scheduler.pause().await;
            "\u{23f8} Paused. Use /resume to continue.".to_string()
        }
        "resume" => match state.scheduler.resume().await {
            Ok(()) => "\u{25b6} Resumed.".to_string(),
            Err(e) => format!("Failed to resume: {}", escape_html(&e.to_string())),
        },
        "stop" => {
            state.scheduler.stop().await;
            "\u{23f9} Stopped. Use /start to arm again.".to_string()
        }
        "getlast" => {
            let fs = state.scheduler.forward_state().await;
            format!(
                "Candidate id: <code>{}</code>\nLast forwarded: {}",
                fs.last_message_id,
                format_time(fs.last_forwarded_at),
            )
        }
        "setlast" => match args.parse::<i32>() {
            Ok(id) if id > 0 => match state.scheduler.override_last_id(MessageId(id)).await {
                Ok(()) => format!("Candidate id set to <code>{id}</code>."),
                Err(e) => format!("Failed to save: {}", escape_html(&e.to_string())),
            },
            _ => "Usage: /setlast &lt;positive message id&gt;".to_string(),
        },
        "forwardnow" => match state.scheduler.forward_now().await {
            Ok(result) => cycle_summary_html(&result),
            Err(e) => format!("Cycle failed: {}", escape_html(&e.to_string())),
        },
        "test" => match args.parse::<i32>() {
            Ok(id) if id > 0 => match state.scheduler.test_message(MessageId(id)).await {
                Existence::Exists => format!("Message <code>{id}</code> exists."),
                Existence::NotFound => format!("Message <code>{id}</code> does not exist."),
                Existence::Inaccessible => "Source channel is unreachable.".to_string(),
            },
            _ => "Usage: /test &lt;positive message id&gt;".to_string(),
        },
        "findlast" => match state.scheduler.find_last_valid().await {
            Ok(r) if r.found => format!(
                "Newest surviving message: <code>{}</code> (probed {}..={}).",
                r.resolved_id, r.probed.0, r.probed.1,
            ),
            Ok(r) => format!(
                "Nothing found in probed range {}..={}.",
                r.probed.0, r.probed.1,
            ),
            Err(e) => format!("Scan failed: {}", escape_html(&e.to_string())),
        },
        "chats" => chats_html(&state.cache.snapshot().await),
        "stats" => {
            let totals = state.scheduler.stats().statistics();
            let recent = state.scheduler.stats().recent(5);
            stats_html(totals, &recent)
        }
        _ => "Unknown command. Send /help for the list.".to_string(),
    };

    let _ = bot
        .send_message(msg.chat.id, reply)
        .parse_mode(ParseMode::Html)
        .await;

    Ok(())
}
