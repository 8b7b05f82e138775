use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use bitz_engine::provider::{OpenAiVisionProvider, VisionProvider};
use bitz_engine::{AnalyzeRequest, EngineConfig, QuestEngine};

#[derive(Debug, Parser)]
#[command(name = "bitz-rs", version, about = "Bitz quest analysis CLI")]
struct Cli {
    /// Root directory for quest state (history, images, caches).
    #[arg(long, default_value = "history")]
    root: PathBuf,
    /// Directory of <flavor>.txt prompt overrides.
    #[arg(long)]
    prompts: Option<PathBuf>,
    #[arg(long, default_value = "gpt-4o")]
    model: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Answer(AnswerArgs),
    LinkSpecies(LinkSpeciesArgs),
    QuestInfo(QuestInfoArgs),
    QuestList,
    ImageVariant(ImageVariantArgs),
    DeleteQuest(DeleteQuestArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    quest: Option<String>,
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    flavor: Option<String>,
    #[arg(long)]
    location: Option<String>,
    /// JSON object or "lat,lon" pair.
    #[arg(long)]
    coordinates: Option<String>,
    #[arg(long)]
    language: Option<String>,
}

#[derive(Debug, Parser)]
struct AnswerArgs {
    #[arg(long)]
    quest: String,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Parser)]
struct LinkSpeciesArgs {
    /// Pairs as "name|name", up to 10.
    #[arg(long = "pair", required = true)]
    pairs: Vec<String>,
}

#[derive(Debug, Parser)]
struct QuestInfoArgs {
    #[arg(long)]
    quest: String,
    #[arg(long)]
    force_reload: bool,
}

#[derive(Debug, Parser)]
struct ImageVariantArgs {
    #[arg(long)]
    quest: String,
    #[arg(long)]
    image: String,
    #[arg(long, default_value = "full")]
    resolution: String,
}

#[derive(Debug, Parser)]
struct DeleteQuestArgs {
    #[arg(long)]
    quest: String,
    /// Must match BITZ_DELETE_SECRET.
    #[arg(long)]
    secret: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("bitz-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let engine = build_engine(&cli)?;
    match cli.command {
        Command::Analyze(args) => run_analyze(&engine, args),
        Command::Answer(args) => run_answer(&engine, args),
        Command::LinkSpecies(args) => run_link_species(&engine, args),
        Command::QuestInfo(args) => run_quest_info(&engine, args),
        Command::QuestList => run_quest_list(&engine),
        Command::ImageVariant(args) => run_image_variant(&engine, args),
        Command::DeleteQuest(args) => run_delete_quest(&engine, args),
    }
}

fn build_engine(cli: &Cli) -> Result<QuestEngine> {
    let provider: Arc<dyn VisionProvider> = Arc::new(OpenAiVisionProvider::new(&cli.model)?);
    let mut config = EngineConfig::new(&cli.root);
    config.prompts_dir = cli.prompts.clone();
    if let Some(freshness) = env_seconds("BITZ_METADATA_FRESHNESS_SECS")? {
        config.metadata_freshness = freshness;
    }
    Ok(QuestEngine::new(config, provider))
}

fn run_analyze(engine: &QuestEngine, args: AnalyzeArgs) -> Result<i32> {
    let quest_id = args
        .quest
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let bytes = fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;

    let request = AnalyzeRequest {
        quest_id: quest_id.clone(),
        user_id: args.user,
        image_b64: BASE64.encode(&bytes),
        location: args.location.map(Value::String),
        coordinates: args.coordinates.as_deref().map(parse_coordinates),
        flavor: args.flavor,
        language: args.language,
    };
    let reply = engine.analyze(&request)?;
    // let the background classification land before a one-shot exit
    engine.wait_for_classification();

    print_json(&json!({"quest_id": quest_id, "reply": reply}))
}

fn run_answer(engine: &QuestEngine, args: AnswerArgs) -> Result<i32> {
    let reply = engine.answer(&args.quest, &args.text)?;
    print_json(&serde_json::to_value(&reply)?)
}

fn run_link_species(engine: &QuestEngine, args: LinkSpeciesArgs) -> Result<i32> {
    let pairs: Vec<Vec<String>> = args
        .pairs
        .iter()
        .map(|pair| {
            pair.split('|')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .collect();
    let results = engine.link_species(&pairs)?;
    print_json(&serde_json::to_value(&results)?)
}

fn run_quest_info(engine: &QuestEngine, args: QuestInfoArgs) -> Result<i32> {
    let info = engine.quest_info(&args.quest, args.force_reload)?;
    print_json(&serde_json::to_value(&info)?)
}

fn run_quest_list(engine: &QuestEngine) -> Result<i32> {
    let listing = engine.quest_list()?;
    print_json(&serde_json::to_value(&listing)?)
}

fn run_image_variant(engine: &QuestEngine, args: ImageVariantArgs) -> Result<i32> {
    let path = engine.image_variant(&args.quest, &args.image, &args.resolution)?;
    print_json(&json!({"path": path.to_string_lossy()}))
}

fn run_delete_quest(engine: &QuestEngine, args: DeleteQuestArgs) -> Result<i32> {
    let expected = env::var("BITZ_DELETE_SECRET").unwrap_or_default();
    if expected.is_empty() {
        bail!("quest deletion is disabled: BITZ_DELETE_SECRET is not set");
    }
    if args.secret != expected {
        bail!("quest deletion refused: secret mismatch");
    }
    engine.delete_quest(&args.quest)?;
    print_json(&json!({"deleted": args.quest}))
}

fn print_json(value: &Value) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(0)
}

/// "lat,lon" becomes the object form the engine stores; anything that
/// parses as JSON passes through unchanged.
fn parse_coordinates(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() == 2 {
        return json!({"latitude": parts[0], "longitude": parts[1]});
    }
    Value::String(raw.to_string())
}

fn env_seconds(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => {
            let seconds: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds"))?;
            Ok(Some(Duration::from_secs(seconds)))
        }
        Err(_) => Ok(None),
    }
}
