//! Terminal rendering of engine events.

use parley_core::{
    ActivityEvent, NoticeEvent, NoticeKind, Speaker, TranscriptEvent, TurnState, TurnStatusEvent,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Meter width in characters at full scale.
const METER_WIDTH: usize = 40;
/// RMS mapped to a full meter.
const METER_FULL_SCALE: f32 = 0.2;
/// Print one meter line per this many activity events (~100 ms at 16 ms frames).
const METER_DECIMATION: u64 = 6;

pub fn status_line(event: &TurnStatusEvent) -> String {
    let label = match event.state {
        TurnState::Idle => "idle",
        TurnState::Listening => "listening",
        TurnState::Capturing => "hearing you",
        TurnState::AwaitingReply => "thinking",
        TurnState::Playing => "speaking",
    };
    let mut line = format!("[{label}]");
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" {detail}"));
    }
    if let Some(ms) = event.latency_ms {
        line.push_str(&format!(" ({ms} ms)"));
    }
    line
}

pub fn transcript_line(event: &TranscriptEvent) -> String {
    let who = match event.role {
        Speaker::User => "you",
        Speaker::Assistant => "assistant",
    };
    match event.latency_ms {
        Some(ms) => format!("{who}: {} ({ms} ms)", event.text),
        None => format!("{who}: {}", event.text),
    }
}

pub fn notice_line(event: &NoticeEvent) -> String {
    let tag = match event.kind {
        NoticeKind::Searching => "search",
        NoticeKind::DeviceError => "mic",
        NoticeKind::PlaybackError => "playback",
        NoticeKind::ConnectTimeout | NoticeKind::ConnectionLost => "connection",
        NoticeKind::ReplyTimedOut => "timeout",
        NoticeKind::ServerError => "server",
        NoticeKind::CaptureDropped => "capture",
    };
    format!("! {tag}: {}", event.message)
}

pub fn meter_line(event: &ActivityEvent) -> String {
    let level = &event.level;
    let cells = |v: f32| ((v / METER_FULL_SCALE).clamp(0.0, 1.0) * METER_WIDTH as f32) as usize;
    let filled = cells(level.rms);
    let start_mark = cells(level.start_threshold).min(METER_WIDTH - 1);

    let mut bar: Vec<char> = (0..METER_WIDTH)
        .map(|i| if i < filled { '#' } else { ' ' })
        .collect();
    bar[start_mark] = '|';
    let bar: String = bar.into_iter().collect();

    let marker = if level.speaking {
        '*'
    } else if level.assistant_audible {
        '~'
    } else {
        ' '
    };
    format!(
        "{marker}[{bar}] rms {:.4} floor {:.4}",
        level.rms, level.noise_floor
    )
}

/// Print every event from `rx` through `render` until the engine shuts down.
fn spawn_printer<T, F>(mut rx: broadcast::Receiver<T>, name: &'static str, render: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> Option<String> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = render(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("{name} receiver lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub struct ConsoleReceivers {
    pub status: broadcast::Receiver<TurnStatusEvent>,
    pub transcripts: broadcast::Receiver<TranscriptEvent>,
    pub notices: broadcast::Receiver<NoticeEvent>,
    pub activity: Option<broadcast::Receiver<ActivityEvent>>,
}

pub fn spawn_console(receivers: ConsoleReceivers) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![
        spawn_printer(receivers.status, "status", |e| Some(status_line(e))),
        spawn_printer(receivers.transcripts, "transcript", |e| {
            Some(transcript_line(e))
        }),
        spawn_printer(receivers.notices, "notice", |e| Some(notice_line(e))),
    ];
    if let Some(activity) = receivers.activity {
        tasks.push(spawn_printer(activity, "activity", |e| {
            (e.seq % METER_DECIMATION == 0).then(|| meter_line(e))
        }));
    }
    tasks
}
