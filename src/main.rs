use std::process::ExitCode;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

use opencode_view::app::{ClientApp, Screen};
use opencode_view::config::{ClientConfig, Theme, DEFAULT_ENDPOINT_HINT};
use opencode_view::logging::{self, LogConfig};
use opencode_view::subscription::{CloseReason, SubscriptionState};
use opencode_view::terminal::{
    compose_chat_frame, compose_settings_frame, terminal_size_or_default, ChatChrome, ChatView,
    Palette,
};
use opencode_view::SessionApi;

/// Redraw interval when nothing else happens, so terminal resizes are picked up.
const IDLE_REDRAW: Duration = Duration::from_millis(500);
const HELP: &str = "j/k scroll · g bottom · n/p session · s settings · t <theme> · r reconnect · q quit";

enum Input {
    Line(std::io::Result<Option<String>>),
    Applied,
    Tick,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = logging::init(&LogConfig::from_env()) {
        eprintln!("opencode-view: {error}");
        return ExitCode::FAILURE;
    }

    let mut app = ClientApp::with_http(ClientConfig::from_env());
    app.bootstrap().await;

    let result = run(&mut app).await;
    app.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "terminal I/O failed");
            eprintln!("opencode-view: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run<A: SessionApi>(app: &mut ClientApp<A>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut view = ChatView::default();
    let mut notice: Option<String> = None;

    loop {
        draw(app, &mut view, notice.as_deref(), &mut stdout).await?;

        let streaming = app.subscription_state().is_active();
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line),
            _ = app.next_update(), if streaming => Input::Applied,
            _ = tokio::time::sleep(IDLE_REDRAW) => Input::Tick,
        };

        match input {
            Input::Line(line) => {
                let Some(line) = line? else {
                    return Ok(());
                };
                notice = None;
                if handle_line(app, &mut view, line.trim(), &mut notice).await == Flow::Quit {
                    stdout.write_all(b"\r\n").await?;
                    stdout.flush().await?;
                    return Ok(());
                }
            }
            Input::Applied | Input::Tick => {}
        }
    }
}

async fn handle_line<A: SessionApi>(
    app: &mut ClientApp<A>,
    view: &mut ChatView,
    line: &str,
    notice: &mut Option<String>,
) -> Flow {
    if app.screen() == Screen::Settings {
        if line.is_empty() && app.close_settings() {
            return Flow::Continue;
        }
        if matches!(line, "q" | "quit") {
            return Flow::Quit;
        }
        let theme = app.theme();
        if app.save_settings(line, theme).await.is_ok() {
            *notice = Some("Settings saved".to_string());
        }
        return Flow::Continue;
    }

    let (_, rows) = terminal_size_or_default();
    let page = i64::from(rows / 2).max(1);
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "q" | "quit" => return Flow::Quit,
        "k" | "up" => view.list_mut().scroll_by(-page),
        "j" | "down" => view.list_mut().scroll_by(page),
        "u" | "top" => view.list_mut().scroll_to(0),
        "g" | "bottom" => view.list_mut().scroll_to_bottom(),
        "n" | "p" => {
            let offset = if command == "n" { 1 } else { -1 };
            if let Some(target) = adjacent_session(app, offset) {
                app.select_session(&target).await;
            }
        }
        "s" | "settings" => app.open_settings(),
        "t" | "theme" => match argument.parse::<Theme>() {
            Ok(theme) => app.set_theme(theme),
            Err(error) => *notice = Some(error.to_string()),
        },
        "r" | "reconnect" => {
            app.bootstrap().await;
        }
        "?" | "help" => *notice = Some(HELP.to_string()),
        other => *notice = Some(format!("unknown command '{other}'; {HELP}")),
    }
    Flow::Continue
}

fn adjacent_session<A: SessionApi>(app: &ClientApp<A>, offset: isize) -> Option<String> {
    let sessions = app.store().sessions();
    if sessions.is_empty() {
        return None;
    }
    let current = app
        .store()
        .current_session_id()
        .and_then(|id| sessions.iter().position(|session| session.id == id))
        .unwrap_or(0);
    let len = sessions.len() as isize;
    let next = (current as isize + offset).rem_euclid(len) as usize;
    sessions.get(next).map(|session| session.id.clone())
}

fn status_text<A: SessionApi>(app: &ClientApp<A>, notice: Option<&str>) -> String {
    let connection = match app.subscription_state() {
        SubscriptionState::Idle => "offline".to_string(),
        SubscriptionState::Connecting => "connecting".to_string(),
        SubscriptionState::Streaming => "live".to_string(),
        SubscriptionState::Closed(CloseReason::Ended) => "stream ended (r to reconnect)".to_string(),
        SubscriptionState::Closed(CloseReason::Detached) => "disconnected".to_string(),
        SubscriptionState::Closed(CloseReason::Failed(message)) => {
            format!("stream failed: {message}")
        }
    };
    let sessions = app.store().sessions().len();
    format!(
        "{connection} · {sessions} session(s) · {}",
        notice.unwrap_or("? for help")
    )
}

async fn draw<A: SessionApi>(
    app: &ClientApp<A>,
    view: &mut ChatView,
    notice: Option<&str>,
    stdout: &mut Stdout,
) -> std::io::Result<()> {
    let (columns, rows) = terminal_size_or_default();
    let width = usize::from(columns);
    let palette = Palette::for_theme(app.theme());

    if app.screen() == Screen::Settings {
        let frame = compose_settings_frame(
            &palette,
            app.config().endpoint(),
            DEFAULT_ENDPOINT_HINT,
            app.theme(),
            app.alert(),
            width,
        );
        stdout.write_all(frame.as_bytes()).await?;
        return stdout.flush().await;
    }

    let chrome_rows = 3 + usize::from(app.alert().is_some());
    let pane_height = usize::from(rows).saturating_sub(chrome_rows).max(1);
    view.refresh(app.store(), width, pane_height);

    let status = status_text(app, notice);
    let chrome = ChatChrome {
        sessions: app.store().sessions(),
        current: app.store().current_session_id(),
        status: &status,
        alert: app.alert(),
    };

    // Second pass only when the first one changed row geometry.
    for _ in 0..2 {
        let pane = view.visible_lines(app.store(), pane_height);
        let frame = compose_chat_frame(&palette, chrome, &pane, width);
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;

        let outcome = view.after_paint();
        if outcome.measured == 0 && !outcome.scrolled {
            break;
        }
    }
    Ok(())
}
