use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stormwatch_core::{AppError, Config, ConfigError, LocationError, NetworkError};
use stormwatch_weather::{
    AlertStore, BackgroundScheduler, CacheStore, Clock, DesktopSink, FanoutSink, LocationKey,
    LocationWeather, NotificationDedup, NotificationSink, OpenWeatherProvider, RefreshCoordinator,
    Refresher, SqliteStore, SystemClock, TracingSink, TtlPolicy, UiEvent, UiState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "Usage: stormwatch [run | list | add <name> | remove <name> | alerts <name> on|off]";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

struct App {
    coordinator: RefreshCoordinator,
    scheduler: BackgroundScheduler,
}

impl App {
    fn new(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = SqliteStore::open(config.database_path())
            .map_err(AppError::from)
            .context("Failed to open weather database")?;
        let alerts = Arc::new(
            AlertStore::open(config.data_dir.join("alerts.db"))
                .map_err(AppError::from)
                .context("Failed to open alert database")?,
        );
        let dedup = Arc::new(
            NotificationDedup::load(alerts.clone())
                .map_err(AppError::from)
                .context("Failed to load alert history")?,
        );
        let remote = OpenWeatherProvider::new(&config.weather, clock.clone())
            .context("Failed to create weather client")?;

        let refresher = Refresher::new(
            CacheStore::new(Arc::new(store)),
            Arc::new(remote),
            TtlPolicy::from(&config.weather),
            clock,
        );

        let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(TracingSink)];
        if config.notifications.desktop {
            sinks.push(Box::new(DesktopSink::new("Stormwatch")));
        }

        let scheduler = BackgroundScheduler::new(
            refresher.clone(),
            alerts,
            dedup.clone(),
            Arc::new(FanoutSink::new(sinks)),
            config.scheduler.clone(),
        );

        Ok(Self {
            coordinator: RefreshCoordinator::with_alerts(refresher, dedup),
            scheduler,
        })
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<UiEvent>> {
        self.coordinator
            .take_events()
            .context("Event stream already taken")
    }

    async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let background = self.scheduler.clone().spawn(shutdown.clone());

        let mut events = self.events()?;
        let mut list = self.coordinator.subscribe_list();
        self.coordinator.load_all();

        println!("Stormwatch running, press Ctrl-C to stop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                Some(event) = events.recv() => log_event(&event),
                changed = list.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let UiState::Success(locations) = &*list.borrow_and_update() {
                        tracing::info!("Showing {} locations", locations.len());
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        self.coordinator.on_suspend(false);
        shutdown.cancel();
        background.await.context("Background scheduler panicked")?;
        Ok(())
    }

    async fn list(&self) -> Result<()> {
        let mut list = self.coordinator.subscribe_list();
        self.coordinator.load_all();

        let state = tokio::time::timeout(COMMAND_TIMEOUT, list.wait_for(|s| !s.is_loading()))
            .await
            .context("Timed out loading locations")?
            .context("Coordinator stopped")?
            .clone();

        match state {
            UiState::Success(locations) if locations.is_empty() => {
                println!("No locations tracked. Add one with `stormwatch add <name>`.");
            }
            UiState::Success(locations) => {
                for location in &locations {
                    print_location(location);
                }
            }
            UiState::Error(kind) => anyhow::bail!("Could not load locations ({:?})", kind),
            UiState::Loading => {}
        }
        Ok(())
    }

    async fn add(&self, key: LocationKey) -> Result<()> {
        let mut events = self.events()?;
        self.coordinator.add_location(key.clone());

        let event = tokio::time::timeout(COMMAND_TIMEOUT, events.recv())
            .await
            .context("Timed out adding location")?
            .context("Coordinator stopped")?;

        match event {
            UiEvent::LocationAdded(_) => {
                println!("Added {}", key);
                if let Some(entry) = self.coordinator.refresher().cache().get(&key).await {
                    let refresher = self.coordinator.refresher();
                    print_location(&LocationWeather::from_entry(
                        entry,
                        refresher.ttl(),
                        refresher.clock().now(),
                    ));
                }
                Ok(())
            }
            UiEvent::DuplicateLocation(_) => {
                println!("{}", LocationError::Duplicate(key.to_string()).user_message());
                Ok(())
            }
            UiEvent::LocationNotFound(_) => {
                Err(AppError::from(LocationError::NotFound(key.to_string())).into())
            }
            UiEvent::Offline => Err(AppError::from(NetworkError::ConnectionFailed(format!(
                "could not reach the weather service for {}",
                key
            )))
            .into()),
            other => Err(AppError::Service(format!("could not add {}: {:?}", key, other)).into()),
        }
    }

    async fn remove(&self, key: LocationKey) -> Result<()> {
        let cache = self.coordinator.refresher().cache();
        cache.initialize().await.map_err(AppError::from)?;
        self.coordinator
            .remove_location(&key)
            .await
            .map_err(AppError::from)?;
        println!("Removed {}", key);
        Ok(())
    }

    async fn alerts(&self, key: LocationKey, enabled: bool) -> Result<()> {
        if enabled {
            let delivered = self
                .scheduler
                .enable_alerts(&key)
                .await
                .map_err(AppError::from)?;
            println!("Alerts enabled for {}", key);
            if !delivered {
                println!("No dangerous weather expected tomorrow");
            }
        } else {
            self.scheduler
                .disable_alerts(&key)
                .await
                .map_err(AppError::from)?;
            println!("Alerts disabled for {}", key);
        }
        Ok(())
    }
}

fn log_event(event: &UiEvent) {
    match event {
        UiEvent::Offline => tracing::warn!("Offline, showing cached weather"),
        UiEvent::StorageFailed => tracing::error!("Weather storage failed"),
        other => tracing::info!("{:?}", other),
    }
}

fn print_location(weather: &LocationWeather) {
    match &weather.current {
        Some(current) => println!(
            "{}: {:.1} °C{}",
            weather.key,
            current.temperature,
            if weather.current_stale { " (stale)" } else { "" }
        ),
        None => println!("{}: no current observation", weather.key),
    }
    for day in &weather.days {
        println!(
            "  {}  {:>5.1} / {:>5.1} °C  {}",
            day.date.format("%a %d %b"),
            day.temp_min,
            day.temp_max,
            day.condition().description()
        );
    }
}

fn parse_key(arg: Option<&String>) -> Result<LocationKey> {
    let name = arg.context(USAGE)?;
    LocationKey::parse(name).map_err(|e| AppError::from(e).into())
}

/// Commands that talk to the weather service need an API key.
fn require_api_key(config: &Config) -> Result<()> {
    if config.weather.resolved_api_key().is_none() {
        return Err(AppError::from(ConfigError::MissingSetting("weather.api_key".into())).into());
    }
    Ok(())
}

async fn dispatch(app: App, config: &Config, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        None | Some("run") => {
            require_api_key(config)?;
            app.run().await
        }
        Some("list") => app.list().await,
        Some("add") => {
            require_api_key(config)?;
            app.add(parse_key(args.get(1))?).await
        }
        Some("remove") => app.remove(parse_key(args.get(1))?).await,
        Some("alerts") => {
            let key = parse_key(args.get(1))?;
            match args.get(2).map(String::as_str) {
                Some("on") => {
                    require_api_key(config)?;
                    app.alerts(key, true).await
                }
                Some("off") => app.alerts(key, false).await,
                _ => anyhow::bail!(USAGE),
            }
        }
        Some(_) => anyhow::bail!(USAGE),
    }
}

async fn run_cli() -> Result<()> {
    let (config, _) = Config::load_validated()?;
    let app = App::new(&config)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    dispatch(app, &config, &args).await
}

#[tokio::main]
async fn main() -> Result<()> {
    stormwatch_core::init()?;

    let result = run_cli().await;
    if let Err(e) = &result {
        if let Some(app_error) = e.downcast_ref::<AppError>() {
            tracing::error!("{:#}", e);
            eprintln!("{}", app_error.user_message());
        }
    }
    result
}
