use clap::Parser;
use scada_types::{HardwareLayout, InternalShutdown};
use scadad::{config, App, ScadaError, ScadaResult, ScadaSettings};
use std::{path::PathBuf, str::FromStr};
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[clap(name = "scadad", version, about = "Scada agent for residential thermal storage")]
struct Cli {
    /// Env file loaded before the environment [default: $HOME/.config/gridworks/scada/.env]
    #[clap(long)]
    env_file: Option<PathBuf>,
    /// Hardware layout, overriding SCADA_LAYOUT_PATH
    #[clap(long)]
    layout: Option<PathBuf>,
    /// Log level, overriding SCADA_LOG_LEVEL
    #[clap(long)]
    log_level: Option<String>,
}

async fn start(cli: Cli) -> ScadaResult<InternalShutdown> {
    let env_file = config::load_env_file(cli.env_file.as_deref())?;
    let mut settings = ScadaSettings::from_env()?;
    if let Some(layout) = cli.layout {
        settings.layout_path = layout;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    LogTracer::init().expect("Unable to set up log tracer");
    let log = rolling::daily(&settings.log_dir, "scadad");
    let (nb, _guard) = tracing_appender::non_blocking(log);
    let level = tracing::Level::from_str(&settings.log_level).unwrap_or(tracing::Level::INFO);
    let sub = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(nb)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    if let Some(path) = env_file {
        log::info!("Loaded settings from {}", path.display());
    }
    let layout = HardwareLayout::load(&settings.layout_path).map_err(|e| {
        log::error!(
            "Unable to load layout {}: {e:}",
            settings.layout_path.display()
        );
        e
    })?;

    let mut app = App::build(&settings, layout).map_err(|e| {
        log::error!("Startup failed: {e:}");
        e
    })?;
    app.run().await
}

#[actix::main]
async fn main() {
    let code = match start(Cli::parse()).await {
        Ok(shutdown) if shutdown.exit_code == InternalShutdown::CLEAN => {
            log::info!("Exiting: {}", shutdown.reason);
            InternalShutdown::CLEAN
        }
        Ok(shutdown) => {
            let error = ScadaError::Shutdown(shutdown);
            eprintln!("scadad: {error:}");
            error.exit_code()
        }
        Err(e) => {
            eprintln!("scadad: {e:}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
