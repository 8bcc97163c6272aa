use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use folio_contracts::events::EventWriter;
use folio_contracts::request::{
    EvaluationMode, GenerationRequest, ModelOverrides, NamedReference, ReferencePhoto,
};
use folio_contracts::session::IllustrationResult;
use folio_engine::{derive_fingerprint, EngineConfig, IllustrationEngine, ResultCache, SessionHooks};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "folio-rs", version, about = "Storybook illustration engine")]
struct Cli {
    /// Tracing filter, e.g. `debug` or `folio_engine=trace`. Defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one illustration with quality retries.
    Illustrate(IllustrateArgs),
    /// Print the cache fingerprint of a request.
    Fingerprint(FingerprintArgs),
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// Prompt text, or `@path` to read it from a file.
    #[arg(long)]
    prompt: String,
    /// Reference photo as `path`, `name=path`, or a data URI. Repeatable.
    #[arg(long = "reference")]
    references: Vec<String>,
}

#[derive(Debug, Parser)]
struct IllustrateArgs {
    #[command(flatten)]
    request: RequestArgs,
    /// Previous page image chained in for continuity.
    #[arg(long)]
    previous: Option<PathBuf>,
    #[arg(long, default_value = "scene")]
    mode: EvaluationMode,
    /// Text the cover must show (cover mode), or `NO TEXT`.
    #[arg(long)]
    expected_text: Option<String>,
    /// Where to write the final image.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// JSON file backing the result cache across runs.
    #[arg(long)]
    cache_file: Option<PathBuf>,
    #[arg(long)]
    generation_model: Option<String>,
    #[arg(long)]
    evaluation_model: Option<String>,
    #[arg(long)]
    threshold: Option<u8>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Accept the first image when no evaluator is configured.
    #[arg(long)]
    accept_unevaluated: bool,
    /// Offline adapters; no credentials needed.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct FingerprintArgs {
    #[command(flatten)]
    request: RequestArgs,
    /// Whether a previous page is chained in.
    #[arg(long)]
    continuity: bool,
}

const EXIT_EXHAUSTED: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("folio-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    match cli.command {
        Command::Illustrate(args) => {
            let result = run_illustrate(&args)?;
            println!("{}", serde_json::to_string_pretty(&result.summary())?);
            Ok(if result.is_accepted() { 0 } else { EXIT_EXHAUSTED })
        }
        Command::Fingerprint(args) => {
            println!("{}", run_fingerprint(&args)?);
            Ok(0)
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn run_illustrate(args: &IllustrateArgs) -> Result<IllustrationResult> {
    let mut config = EngineConfig::from_env();
    if let Some(threshold) = args.threshold {
        config.quality_threshold = threshold.min(100);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts.max(1);
    }
    config.accept_unevaluated |= args.accept_unevaluated;

    let mut engine = if args.dryrun {
        IllustrationEngine::dryrun(config)
    } else {
        IllustrationEngine::gemini(config)
    };
    if let Some(cache_file) = &args.cache_file {
        engine = engine.with_result_cache(Arc::new(ResultCache::with_snapshot(cache_file)));
    }

    let mut request = build_request(&args.request)?;
    request.evaluation_mode = args.mode;
    request.expected_text = args.expected_text.clone();
    if let Some(previous) = &args.previous {
        request.previous_image = Some(read_image_as_data_url(previous)?);
    }
    if args.generation_model.is_some() || args.evaluation_model.is_some() {
        request.model_overrides = Some(ModelOverrides {
            generation_model: args.generation_model.clone(),
            evaluation_model: args.evaluation_model.clone(),
        });
    }

    let mut hooks = SessionHooks::new()
        .on_image_ready(|image, model_id| {
            info!(model_id, bytes = image.len(), "image ready");
            Ok(())
        })
        .usage_tracker(|generation, evaluation, models| {
            debug!(
                generation_model = %models.generation,
                evaluation_model = ?models.evaluation,
                generation_tokens = generation.total_tokens,
                evaluation_tokens = evaluation.map(|usage| usage.total_tokens).unwrap_or(0),
                "usage"
            );
        });
    if let Some(events) = &args.events {
        hooks = hooks.events(EventWriter::for_new_session(events));
    }

    let result = engine.illustrate(&request, &hooks)?;
    if let Some(out) = &args.out {
        if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(out, &result.image_data.bytes)
            .with_context(|| format!("failed to write {}", out.display()))?;
        info!(path = %out.display(), mime_type = %result.image_data.mime_type, "wrote illustration");
    }
    Ok(result)
}

fn run_fingerprint(args: &FingerprintArgs) -> Result<String> {
    let request = build_request(&args.request)?;
    Ok(derive_fingerprint(&request.prompt, &request.reference_photos, args.continuity).to_string())
}

fn build_request(args: &RequestArgs) -> Result<GenerationRequest> {
    let mut request = GenerationRequest::new(read_prompt_arg(&args.prompt)?);
    for raw in &args.references {
        request = request.with_reference(parse_reference_arg(raw)?);
    }
    Ok(request)
}

fn read_prompt_arg(raw: &str) -> Result<String> {
    let Some(path) = raw.strip_prefix('@') else {
        return Ok(raw.to_string());
    };
    let prompt = fs::read_to_string(path).with_context(|| format!("failed to read prompt file {path}"))?;
    if prompt.trim().is_empty() {
        bail!("prompt file {path} is empty");
    }
    Ok(prompt)
}

fn parse_reference_arg(raw: &str) -> Result<ReferencePhoto> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty --reference value");
    }
    if raw.starts_with("data:") {
        return Ok(ReferencePhoto::from(raw));
    }
    let (name, location) = match raw.split_once('=') {
        Some((name, location)) if !name.trim().is_empty() && !location.trim().is_empty() => {
            (Some(name.trim().to_string()), location.trim())
        }
        _ => (None, raw),
    };
    let photo_uri = if location.starts_with("data:") {
        location.to_string()
    } else {
        read_image_as_data_url(Path::new(location))?
    };
    Ok(ReferencePhoto::Named(NamedReference {
        name,
        photo_uri,
        photo_hash: None,
    }))
}

fn read_image_as_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(format!(
        "data:{};base64,{}",
        guess_image_mime(path),
        BASE64.encode(bytes)
    ))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use clap::Parser;
    use folio_contracts::request::{EvaluationMode, ReferencePhoto};

    use super::{
        guess_image_mime, parse_reference_arg, read_prompt_arg, run_fingerprint, run_illustrate,
        Cli, Command,
    };

    const ONE_PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    fn write_png(dir: &Path, name: &str) -> anyhow::Result<std::path::PathBuf> {
        use base64::Engine as _;
        let path = dir.join(name);
        fs::write(&path, base64::engine::general_purpose::STANDARD.decode(ONE_PIXEL_PNG)?)?;
        Ok(path)
    }

    #[test]
    fn reference_args_accept_names_paths_and_data_uris() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = write_png(temp.path(), "mia.png")?;

        let named = parse_reference_arg(&format!("Mia={}", path.display()))?;
        assert_eq!(named.name(), Some("Mia"));
        assert!(named.uri().starts_with("data:image/png;base64,"));

        let bare = parse_reference_arg(&path.display().to_string())?;
        assert_eq!(bare.name(), None);
        assert_eq!(bare.uri(), named.uri());

        let inline = parse_reference_arg("data:image/jpeg;base64,AAAA")?;
        assert_eq!(inline, ReferencePhoto::from("data:image/jpeg;base64,AAAA"));

        assert!(parse_reference_arg("Leo=/definitely/missing.png").is_err());
        assert!(parse_reference_arg("  ").is_err());
        Ok(())
    }

    #[test]
    fn prompt_can_come_from_a_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("page.txt");
        fs::write(&path, "Scene: Mia finds a shell.")?;
        assert_eq!(
            read_prompt_arg(&format!("@{}", path.display()))?,
            "Scene: Mia finds a shell."
        );
        assert_eq!(read_prompt_arg("inline prompt")?, "inline prompt");
        fs::write(&path, "   ")?;
        assert!(read_prompt_arg(&format!("@{}", path.display())).is_err());
        Ok(())
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(guess_image_mime(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(guess_image_mime(Path::new("a.webp")), "image/webp");
        assert_eq!(guess_image_mime(Path::new("a")), "image/png");
    }

    #[test]
    fn fingerprint_ignores_reference_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mia = write_png(temp.path(), "mia.png")?;
        let leo = temp.path().join("leo.jpg");
        fs::write(&leo, b"not really a jpeg")?;
        let parse = |refs: [&Path; 2]| {
            let mut argv = vec!["folio-rs".to_string(), "fingerprint".to_string()];
            argv.extend(["--prompt".to_string(), "Scene: dunes".to_string()]);
            for path in refs {
                argv.extend(["--reference".to_string(), path.display().to_string()]);
            }
            Cli::try_parse_from(argv)
        };
        let (Command::Fingerprint(forward), Command::Fingerprint(reversed)) = (
            parse([mia.as_path(), leo.as_path()])?.command,
            parse([leo.as_path(), mia.as_path()])?.command,
        ) else {
            anyhow::bail!("expected fingerprint commands");
        };
        let forward = run_fingerprint(&forward)?;
        assert_eq!(forward, run_fingerprint(&reversed)?);
        assert_eq!(forward.len(), 32);
        Ok(())
    }

    #[test]
    fn dryrun_illustrate_writes_the_image_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("out").join("page-1.png");
        let events = temp.path().join("events.jsonl");
        let cache = temp.path().join("cache.json");
        let argv = vec![
            "folio-rs".to_string(),
            "illustrate".to_string(),
            "--prompt".to_string(),
            "Scene: a paper boat on a puddle".to_string(),
            "--mode".to_string(),
            "cover".to_string(),
            "--expected-text".to_string(),
            "NO TEXT".to_string(),
            "--out".to_string(),
            out.display().to_string(),
            "--events".to_string(),
            events.display().to_string(),
            "--cache-file".to_string(),
            cache.display().to_string(),
            "--accept-unevaluated".to_string(),
            "--dryrun".to_string(),
        ];
        let Command::Illustrate(args) = Cli::try_parse_from(argv)?.command else {
            anyhow::bail!("expected illustrate command");
        };
        assert_eq!(args.mode, EvaluationMode::Cover);

        let result = run_illustrate(&args)?;
        assert!(result.is_accepted());
        assert_eq!(fs::read(&out)?, result.image_data.bytes);
        assert!(fs::read_to_string(&events)?.contains("\"session_finished\""));
        assert!(fs::read_to_string(&cache)?.contains("dryrun-image-1"));
        assert_eq!(result.summary()["imageData"], "<omitted>");
        Ok(())
    }
}
