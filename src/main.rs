use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use hostguest::app::{self, App, AppHandle, StatusLevel};
use hostguest::config::{self, Config, GuestKind};
use hostguest::core::{Action, Module};
use hostguest::ui;
use hostguest::{
    local, Bridge, BridgeSettings, GuestScheduler, HostExit, HostLoop, LocalScheduler, QueueHost,
    TokioGuest,
};

#[derive(Debug, Parser)]
#[command(
    name = "hostguest",
    version,
    about = "Run a cooperative guest scheduler in bursts inside a terminal host loop"
)]
struct Args {
    /// Config file (defaults to $HOSTGUEST_CONFIG or ~/.config/hostguest/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start the guest run immediately instead of waiting for the button
    #[arg(long)]
    autostart: bool,

    /// Run without a terminal UI; exits when the guest run is done
    #[arg(long)]
    headless: bool,

    /// Guest scheduler to embed
    #[arg(long, value_enum)]
    guest: Option<GuestKind>,

    /// How long the demo task waits before changing the label
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Give up on a guest run after this many bursts
    #[arg(long)]
    max_bursts: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, broken) = match &args.config {
        Some(path) => (config::load_from(path)?, None),
        None => match config::load() {
            Ok(config) => (config, None),
            Err(err) => (Config::default(), Some(err)),
        },
    };
    apply_args(&mut config, &args);
    init_logging(&config, args.headless)?;
    if let Some(err) = broken {
        log::warn!("ignoring default config, using built-in defaults: {err:#}");
    }

    let host = QueueHost::new();
    let app = App::new().handle();
    let settings = BridgeSettings {
        max_bursts: config.bridge.max_bursts,
    };
    let delay = Duration::from_millis(config.demo.delay_ms);

    match config.guest.scheduler {
        GuestKind::Local => {
            app.borrow_mut().guest_name = "local";
            let bridge = Bridge::with_settings(
                Rc::new(host.clone()),
                LocalScheduler::new(),
                app.clone(),
                settings,
            );
            bridge.configure(move |ctx| app::ask_question(ctx, move || local::sleep(delay)));
            run(&args, &config, host, app, bridge)
        }
        GuestKind::Tokio => {
            app.borrow_mut().guest_name = "tokio";
            let bridge = Bridge::with_settings(
                Rc::new(host.clone()),
                TokioGuest::new()?,
                app.clone(),
                settings,
            );
            bridge.configure(move |ctx| {
                app::ask_question(ctx, move || tokio::time::sleep(delay))
            });
            run(&args, &config, host, app, bridge)
        }
    }
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(guest) = args.guest {
        config.guest.scheduler = guest;
    }
    if let Some(delay_ms) = args.delay_ms {
        config.demo.delay_ms = delay_ms;
    }
    if args.max_bursts.is_some() {
        config.bridge.max_bursts = args.max_bursts;
    }
    if args.autostart {
        config.demo.autostart = true;
    }
}

fn init_logging(config: &Config, headless: bool) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(config.log.filter.clone());
    let mut builder = env_logger::Builder::from_env(env);

    // Raw-mode terminal output would be corrupted by stderr logging
    if !headless {
        match config::log_path(config) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create log directory {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("open log file {}", path.display()))?;
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            None => {
                builder.filter_level(log::LevelFilter::Off);
            }
        }
    }

    builder.try_init().context("initialise logger")?;
    Ok(())
}

fn run<S>(
    args: &Args,
    config: &Config,
    host: QueueHost,
    app: AppHandle,
    bridge: Bridge<S, AppHandle>,
) -> Result<()>
where
    S: GuestScheduler + 'static,
{
    {
        let bridge = bridge.clone();
        host.on_about_to_quit(move || {
            let cancelled = bridge.shutdown();
            log::info!("guest shut down, {cancelled} tasks cancelled");
        });
    }

    if args.headless {
        return run_headless(config, &host, &app, &bridge);
    }

    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    if config.demo.autostart {
        perform(Action::StartGuest, config, &host, &app, &bridge);
    }

    let res = run_app(&mut terminal, config, &host, &app, &bridge);

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("{err:?}");
    }

    if let Some(code) = host.exit_code() {
        std::process::exit(code);
    }
    Ok(())
}

fn run_app<B, S>(
    terminal: &mut Terminal<B>,
    config: &Config,
    host: &QueueHost,
    app: &AppHandle,
    bridge: &Bridge<S, AppHandle>,
) -> Result<()>
where
    B: ratatui::backend::Backend,
    S: GuestScheduler + 'static,
{
    let tick_rate = Duration::from_millis(config.host.tick_rate_ms);
    let mut last_tick = Instant::now();

    loop {
        app.borrow_mut().bridge = Some(bridge.stats());
        terminal.draw(|f| ui::draw(f, &mut app.borrow_mut()))?;
        if host.should_quit() {
            return Ok(());
        }

        // Guest bursts run here, while no borrow of the app is held
        host.process_due(Instant::now());

        let now = Instant::now();
        let mut timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if host.has_due(now) {
            timeout = Duration::from_secs(0);
        } else if let Some(deadline) = host.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }

        if event::poll(timeout)? {
            let action = match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    app.borrow_mut().handle_key(key)
                }
                Event::Mouse(mouse) => app.borrow_mut().handle_mouse(mouse),
                _ => Action::None,
            };
            perform(action, config, host, app, bridge);
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }
}

fn perform<S>(
    action: Action,
    config: &Config,
    host: &QueueHost,
    app: &AppHandle,
    bridge: &Bridge<S, AppHandle>,
) where
    S: GuestScheduler + 'static,
{
    match action {
        Action::None => {}
        Action::StartGuest => {
            let result = bridge.start();
            let mut app = app.borrow_mut();
            match result {
                Ok(()) => {
                    let run = bridge.stats().run;
                    app.set_status(format!("Guest run {run} started"), StatusLevel::Info);
                }
                Err(err) => app.set_status(err.to_string(), StatusLevel::Warn),
            }
        }
        Action::CompleteRun => {
            bridge.complete();
            app.borrow_mut()
                .set_status("Completion signalled", StatusLevel::Info);
        }
        Action::Notify(message, level) => app.borrow_mut().set_status(message, level.into()),
        Action::Quit => host.quit(config.host.exit_code),
    }
}

fn run_headless<S>(
    config: &Config,
    host: &QueueHost,
    app: &AppHandle,
    bridge: &Bridge<S, AppHandle>,
) -> Result<()>
where
    S: GuestScheduler + 'static,
{
    bridge.start()?;
    let exit = host.run();
    let stats = bridge.stats();
    log::info!(
        "host exited ({exit:?}); run {} ended {:?} after {} bursts, {} tokens",
        stats.run,
        stats.last_end,
        stats.bursts,
        stats.tokens_posted
    );
    println!("{}", app.borrow().label);

    match exit {
        HostExit::Drained => Ok(()),
        HostExit::Quit(_) => std::process::exit(config.host.exit_code),
    }
}
