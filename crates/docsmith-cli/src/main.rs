use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use docsmith_core::pipeline::source_format;
use docsmith_core::{ConversionRequest, Converter, Route, Settings};
use tracing_subscriber::EnvFilter;

mod output;

use output::ColorMode;

/// docsmith - convert PDF, DOCX, RTF, DOC and HTML documents to HTML or text
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    Html,
    Txt,
}

impl Target {
    fn as_str(self) -> &'static str {
        match self {
            Target::Html => "html",
            Target::Txt => "txt",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a single document; the source format comes from the extension
    Convert {
        /// Document to convert
        file: PathBuf,

        /// Output format
        #[arg(long, value_enum)]
        to: Target,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Conversion option, e.g. `--set zoom=1.5` (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        options: Vec<(String, String)>,

        /// Directory for intermediate files
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },

    /// Check that every external converter can be executed
    CheckTools,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let settings = Settings::load();

    let color = ColorMode(!cli.no_color);
    match cli.command {
        Command::Convert {
            file,
            to,
            output,
            options,
            temp_dir,
        } => convert(settings, file, to, output, options, temp_dir).await,
        Command::CheckTools => check_tools(settings, color).await,
    }
}

async fn convert(
    mut settings: Settings,
    file: PathBuf,
    to: Target,
    output: Option<PathBuf>,
    options: Vec<(String, String)>,
    temp_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let Some(source) = source_format(&file) else {
        bail!("cannot tell the format of {} from its extension", file.display());
    };
    let Some(route) = Route::from_formats(&source, to.as_str()) else {
        bail!("converting .{} to {} is not supported", source, to.as_str());
    };

    let payload = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if !route.matches_magic(&payload) {
        bail!("{} is not a valid .{} document", file.display(), source);
    }

    if let Some(dir) = temp_dir {
        settings.converter.temp_dir = dir;
    }
    let converter = Converter::new(settings.converter);

    let mut request = ConversionRequest::new(payload);
    request.params.extend(options);
    let result = converter
        .convert(route, &request)
        .await
        .with_context(|| format!("Failed to convert {}", file.display()))?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, result.body.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} ({})", path.display(), result.content_type);
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(result.body.as_bytes())?;
            if !result.body.ends_with('\n') {
                writeln!(stdout)?;
            }
        }
    }
    Ok(())
}

async fn check_tools(settings: Settings, color: ColorMode) -> anyhow::Result<()> {
    let converter = Converter::new(settings.converter);
    let statuses = converter.probe_all().await;

    let mut stdout = std::io::stdout().lock();
    let missing = output::print_tool_statuses(&mut stdout, &statuses, color)?;
    if missing > 0 {
        bail!("{missing} of {} converters unavailable", statuses.len());
    }
    Ok(())
}
