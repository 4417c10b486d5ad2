use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, LevelFilter};
use promptrelay::active_app::capture_foreground_app;
use promptrelay::logging::init_logging;
use promptrelay::settings::{get_settings, load_settings};
use promptrelay::{Enhancement, Placement, PromptRelay};
use std::path::PathBuf;

/// Insert a prompt into the application that had focus.
#[derive(Parser, Debug)]
#[command(name = "promptrelay")]
#[command(version)]
#[command(about = "Deliver text into the focused application.", long_about = None)]
struct Cli {
    /// Paste into whatever has focus now, without reactivating a previous app
    #[arg(long)]
    direct: bool,

    /// Settings file (defaults to the per-user settings file)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enhancement as JSON; its placement is overridden by the positional one
    #[arg(long)]
    enhancement: Option<String>,

    /// Where the text goes relative to the field's existing content
    #[arg(value_enum)]
    placement: PlacementArg,

    /// Text to insert; multiple words are joined with spaces
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PlacementArg {
    Cursor,
    Top,
    Bottom,
    Wrap,
}

impl From<PlacementArg> for Placement {
    fn from(arg: PlacementArg) -> Self {
        match arg {
            PlacementArg::Cursor => Placement::Cursor,
            PlacementArg::Top => Placement::Top,
            PlacementArg::Bottom => Placement::Bottom,
            PlacementArg::Wrap => Placement::Wrap,
        }
    }
}

impl Cli {
    fn enhancement(&self) -> Result<Enhancement> {
        let mut enhancement = match &self.enhancement {
            Some(raw) => serde_json::from_str::<Enhancement>(raw)
                .context("Failed to parse --enhancement JSON")?,
            None => Enhancement::default(),
        };
        enhancement.placement = self.placement.into();
        Ok(enhancement)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LevelFilter::Info);
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => get_settings()?,
    };
    let enhancement = cli.enhancement()?;
    let text = cli.text.join(" ");

    let relay = PromptRelay::new(settings);
    info!("Permission status: {:?}", relay.permissions().status());

    let service = relay.service();
    let report = if cli.direct {
        service.insert_directly(text, enhancement).await
    } else {
        service.set_previous_app(capture_foreground_app());
        service.insert(text, enhancement).await
    };
    relay.shutdown();

    info!(
        "Outcome: {:?}, strategy: {:?}, {} ms",
        report.outcome,
        report.strategy,
        report.elapsed.as_millis()
    );
    for error in &report.errors {
        info!("  {error}");
    }

    if !report.is_delivered() {
        bail!("text was not delivered ({:?})", report.outcome);
    }
    Ok(())
}
