use anyhow::{Context, Result};
use std::sync::Arc;
use storybook::core::config::Config;
use storybook::core::io::{NativeStorage, Storage};
use storybook::core::state::StoryBook;
use storybook::services::billing::{EnergyLedger, WebhookOutcome};
use storybook::services::image::{create_image_backend, ImageGateway};
use storybook::services::llm::create_llm;
use storybook::services::setup::run_setup;
use storybook::services::text::{create_text_service, StoryWriter};
use storybook::services::workflow::WorkflowManager;

const FIRST_BOOK_GUIDE: &str = "first-book";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(
        &config.storage_folder,
        config.public_base_url.as_deref(),
    )?);
    let ledger = Arc::new(EnergyLedger::load(storage.clone(), config.billing.starting_balance).await?);

    // `storybook apply-webhook <event.json>` credits a payment event and exits.
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("apply-webhook") {
        let path = args.get(2).context("Usage: storybook apply-webhook <event.json>")?;
        let body = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        match ledger.apply_webhook_str(&body).await? {
            WebhookOutcome::Credited { credits, balance } => {
                println!("Credited {} energy. Balance: {}", credits, balance)
            }
            WebhookOutcome::Duplicate => println!("Event already applied."),
            WebhookOutcome::Ignored => println!("Event ignored."),
        }
        return Ok(());
    }

    let llm = create_llm(&config.llm)?;
    let writer = StoryWriter::new(create_text_service(&config.text, llm)?);

    run_setup(&mut config, &writer).await?;

    if !ledger.has_seen_guide(FIRST_BOOK_GUIDE).await {
        println!("Your hero is drawn first, then the cover, then every page in the same look.");
        println!("Each illustration costs energy; failed ones are refunded.");
        ledger.mark_guide_seen(FIRST_BOOK_GUIDE).await?;
    }

    let backend = create_image_backend(&config.image)?;
    let gateway = ImageGateway::new(backend, ledger.clone(), storage.clone(), config.billing.clone());
    let manager = WorkflowManager::new(config.clone(), writer, gateway, storage);

    let existing = match config.story.book_id.as_deref() {
        Some(id) => manager.load_book(id).await?,
        None => None,
    };
    let mut book: StoryBook = match existing {
        Some(book) => {
            println!("Resuming '{}' ({:?})", book.title, book.phase());
            book
        }
        None => {
            let book = manager.create_book(&config.story).await?;
            config.story.book_id = Some(book.id.clone());
            config.save()?;
            println!("Created '{}' with {} pages.", book.title, book.pages.len());
            book
        }
    };

    let cost = config.billing.cost_for(book.tier);
    let images = 2 + book.missing_pages().len() as u64;
    println!(
        "Energy: {} (about {} per illustration, up to {} illustrations left)",
        ledger.balance().await,
        cost,
        images
    );

    if !config.unattended {
        let go = inquire::Confirm::new("Start illustrating?")
            .with_default(true)
            .prompt()?;
        if !go {
            println!("Stopping as requested.");
            return Ok(());
        }
    }

    if let Err(e) = manager.run(&mut book).await {
        eprintln!("Generation stopped [{}]: {}", e.code(), e);
        if e.is_retryable() {
            eprintln!("This error is temporary; run again to resume.");
        }
        return Err(e.into());
    }
    Ok(())
}
