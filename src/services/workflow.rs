use crate::core::config::{Config, StoryConfig};
use crate::core::error::{GenResult, GenerationError};
use crate::core::io::Storage;
use crate::core::phase::{BookPhase, PhaseEvent};
use crate::core::seed::SeedDeriver;
use crate::core::slots::{ReferenceSet, SlotLayout, SlotPhase};
use crate::core::state::{Identity, StoryBook};
use crate::services::image::{GeneratedImage, ImageGateway, ImageKind, ImageRequest};
use crate::services::prompt::{PromptComposer, PromptPayload};
use crate::services::text::StoryWriter;
use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a cover request ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum CoverOutcome {
    /// The identity was not locked yet, so the sheet was generated instead.
    SheetGenerated(GeneratedImage),
    CoverGenerated(GeneratedImage),
}

#[derive(Debug, Default)]
pub struct PageBatch {
    pub stored: Vec<u32>,
    pub failed: Vec<(u32, GenerationError)>,
}

pub struct WorkflowManager {
    config: Config,
    writer: StoryWriter,
    gateway: ImageGateway,
    storage: Arc<dyn Storage>,
}

impl WorkflowManager {
    pub fn new(
        config: Config,
        writer: StoryWriter,
        gateway: ImageGateway,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self { config, writer, gateway, storage }
    }

    pub fn gateway(&self) -> &ImageGateway {
        &self.gateway
    }

    fn book_key(id: &str) -> String {
        format!("books/{}.json", id)
    }

    pub async fn load_book(&self, id: &str) -> Result<Option<StoryBook>> {
        let key = Self::book_key(id);
        if !self.storage.exists(&key).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&key).await?;
        let mut book: StoryBook =
            serde_json::from_slice(&bytes).with_context(|| format!("Corrupt book record {}", key))?;
        book.normalize_pages();
        Ok(Some(book))
    }

    pub async fn save_book(&self, book: &StoryBook) -> Result<()> {
        let content = serde_json::to_string_pretty(book)?;
        self.storage.write(&Self::book_key(&book.id), content.as_bytes()).await
    }

    /// Writes the story text and persists the new record.
    pub async fn create_book(&self, story: &StoryConfig) -> Result<StoryBook> {
        let mut book = self.writer.generate_structure(story).await?;
        book.normalize_pages();
        self.save_book(&book).await?;
        info!("Created book '{}' ({} pages)", book.title, book.pages.len());
        Ok(book)
    }

    fn request(
        &self,
        book: &StoryBook,
        kind: ImageKind,
        prompt: PromptPayload,
        layout: &SlotLayout,
        seed: u64,
    ) -> ImageRequest {
        ImageRequest {
            book_id: book.id.clone(),
            kind,
            prompt: prompt.render(),
            input_images: layout.packed_urls(),
            image_prompt_strength: self.config.image.prompt_strength,
            seed: Some(seed),
            tier: book.tier,
        }
    }

    /// Copy of `book` with its seed base fixed; genesis books draw one here.
    fn draft(book: &StoryBook) -> (StoryBook, SeedDeriver) {
        let mut deriver = SeedDeriver::new(book.character_seed);
        let mut draft = book.clone();
        draft.character_seed = Some(deriver.base_or_draw());
        (draft, deriver)
    }

    /// Pass 1: the character reference sheet, then its Visual DNA.
    pub async fn generate_sheet(&self, book: &mut StoryBook) -> GenResult<GeneratedImage> {
        let (prompt, dna_hint) = match &book.identity {
            Identity::Unlocked => {
                return Err(GenerationError::MissingPrerequisite("identity prompt"))
            }
            Identity::Requested { prompt, dna_hint } => (prompt.clone(), dna_hint.clone()),
            Identity::Locked { prompt, dna, .. } => (prompt.clone(), Some(dna.clone())),
        };
        // A locked book is never in `NoIdentity`, so this rejects re-sheeting.
        let pending = book.phase().apply(PhaseEvent::SheetRequested)?;
        debug!("Book {} -> {:?}", book.id, pending);

        let (mut draft, mut deriver) = Self::draft(book);
        let refs = ReferenceSet::default().with_identity(draft.hero_photo_url.as_deref());
        let layout = SlotLayout::assemble(&refs, SlotPhase::Sheet, &self.config.image.weights);
        let payload = PromptComposer::new(&draft).sheet_prompt(&prompt, &layout);
        let request = self.request(&draft, ImageKind::Sheet, payload, &layout, deriver.seed_for(0));

        let image = match self.gateway.generate(&request).await {
            Ok(image) => image,
            Err(e) => {
                let back = pending.apply(PhaseEvent::Failed)?;
                warn!("Sheet for {} failed [{}], back to {:?}", book.id, e.code(), back);
                return Err(e);
            }
        };

        let dna = self
            .writer
            .extract_visual_dna(&image.image_url, Some(prompt.as_str()), dna_hint.as_ref())
            .await;
        draft.identity = Identity::Locked { prompt, sheet_url: image.image_url.clone(), dna };
        self.save_book(&draft).await?;
        info!("Book {} -> {:?}", book.id, pending.apply(PhaseEvent::SheetStored)?);
        *book = draft;
        Ok(image)
    }

    /// Entry point for "make me a cover". Never submits a cover while the
    /// identity is still only requested.
    pub async fn request_cover(&self, book: &mut StoryBook) -> GenResult<CoverOutcome> {
        if matches!(book.identity, Identity::Requested { .. }) {
            info!("Book {} has no character sheet yet, generating it first", book.id);
            return self.generate_sheet(book).await.map(CoverOutcome::SheetGenerated);
        }
        self.generate_cover(book).await.map(CoverOutcome::CoverGenerated)
    }

    /// Pass 2: the cover, anchored on the sheet. Replaces any previous cover.
    pub async fn generate_cover(&self, book: &mut StoryBook) -> GenResult<GeneratedImage> {
        if matches!(book.identity, Identity::Requested { .. }) {
            return Err(GenerationError::MissingPrerequisite("character sheet"));
        }
        let pending = book.phase().apply(PhaseEvent::CoverRequested)?;
        debug!("Book {} -> {:?}", book.id, pending);

        let (mut draft, mut deriver) = Self::draft(book);
        let refs = ReferenceSet::default().with_identity(draft.identity.sheet_url());
        let layout = SlotLayout::assemble(&refs, SlotPhase::Cover, &self.config.image.weights);
        let payload = PromptComposer::new(&draft).cover_prompt(&layout);
        let request = self.request(&draft, ImageKind::Cover, payload, &layout, deriver.seed_for(0));

        let image = match self.gateway.generate(&request).await {
            Ok(image) => image,
            Err(e) => {
                let back = pending.apply(PhaseEvent::Failed)?;
                warn!("Cover for {} failed [{}], back to {:?}", book.id, e.code(), back);
                return Err(e);
            }
        };

        draft.cover_image = Some(image.image_url.clone());
        self.save_book(&draft).await?;
        info!("Book {} -> {:?}", book.id, pending.apply(PhaseEvent::CoverStored)?);
        *book = draft;
        Ok(image)
    }

    /// Request for page `number` against the book as it is right now.
    fn page_request(&self, book: &StoryBook, number: u32) -> GenResult<ImageRequest> {
        if book.cover_image.is_none() {
            return Err(GenerationError::MissingPrerequisite("cover image"));
        }
        let page = book
            .page(number)
            .ok_or_else(|| anyhow!("Book {} has no page {}", book.id, number))?;
        let action = if page.art_prompt.trim().is_empty() {
            &page.text
        } else {
            &page.art_prompt
        };

        let refs = ReferenceSet::default()
            .with_identity(book.identity.sheet_url())
            .with_style(book.cover_image.as_deref())
            .with_continuity(book.previous_page_image(number))
            .with_environment(page.scene_environment().or(book.environment_ref.as_deref()))
            .with_prop(book.prop_ref.as_deref())
            .with_lighting(book.lighting_ref.as_deref());
        let layout = SlotLayout::assemble(&refs, SlotPhase::Page, &self.config.image.weights);
        let payload = PromptComposer::new(book).page_prompt(number, action, &layout);
        let seed = SeedDeriver::new(book.character_seed).seed_for(number);
        Ok(self.request(book, ImageKind::Page(number), payload, &layout, seed))
    }

    /// Sets the page URL and saves; the record is unchanged if the save fails.
    async fn commit_page(&self, book: &mut StoryBook, number: u32, url: &str) -> GenResult<BookPhase> {
        let before = book.phase();
        let previous = book.page(number).and_then(|p| p.image_url.clone());
        if let Some(page) = book.page_mut(number) {
            page.image_url = Some(url.to_string());
        }
        let remaining = book.missing_pages().len();
        // Regenerating a page of a finished book keeps it finished.
        let after = if before == BookPhase::Complete {
            BookPhase::Complete
        } else {
            before.apply(PhaseEvent::PageStored { remaining })?
        };
        if let Err(e) = self.save_book(book).await {
            if let Some(page) = book.page_mut(number) {
                page.image_url = previous;
            }
            return Err(e.into());
        }
        Ok(after)
    }

    /// Pass 3, one page.
    pub async fn generate_page(&self, book: &mut StoryBook, number: u32) -> GenResult<GeneratedImage> {
        let (mut draft, _) = Self::draft(book);
        let request = self.page_request(&draft, number)?;
        let image = self.gateway.generate(&request).await?;
        let phase = self.commit_page(&mut draft, number, &image.image_url).await?;
        info!("Book {} page {} stored -> {:?}", book.id, number, phase);
        *book = draft;
        Ok(image)
    }

    async fn generate_shared_page(
        &self,
        shared: &Mutex<StoryBook>,
        number: u32,
        pb: &ProgressBar,
    ) -> GenResult<GeneratedImage> {
        // Continuity is whatever the previous page holds at call time.
        let request = {
            let book = shared.lock().await;
            self.page_request(&book, number)?
        };
        let image = self.gateway.generate(&request).await?;

        let mut book = shared.lock().await;
        let phase = self.commit_page(&mut book, number, &image.image_url).await?;
        debug!("Book {} page {} stored -> {:?}", book.id, number, phase);
        pb.inc(1);
        Ok(image)
    }

    /// Pass 3, every page still missing art, `max_concurrency` at a time.
    pub async fn generate_pages(&self, book: &mut StoryBook) -> GenResult<PageBatch> {
        if book.cover_image.is_none() {
            return Err(GenerationError::MissingPrerequisite("cover image"));
        }
        let missing = book.missing_pages();
        if missing.is_empty() {
            return Ok(PageBatch::default());
        }
        println!("Illustrating {} pages...", missing.len());

        let (draft, _) = Self::draft(book);
        let shared = Mutex::new(draft);

        let pb = ProgressBar::new(missing.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|e| anyhow!(e))?
                .progress_chars("#>-"),
        );

        let results: Vec<(u32, GenResult<GeneratedImage>)> = futures_util::stream::iter(missing)
            .map(|number| {
                let shared = &shared;
                let pb = &pb;
                async move { (number, self.generate_shared_page(shared, number, pb).await) }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        pb.finish_with_message("Illustrations complete");

        let mut batch = PageBatch::default();
        for (number, result) in results {
            match result {
                Ok(_) => batch.stored.push(number),
                Err(e) => {
                    warn!("Page {} of {} failed [{}]: {}", number, book.id, e.code(), e);
                    batch.failed.push((number, e));
                }
            }
        }
        batch.stored.sort_unstable();

        let updated = shared.into_inner();
        // Pages that failed never touched the record; a genesis seed only
        // sticks once something was stored with it.
        if !batch.stored.is_empty() {
            *book = updated;
        }
        Ok(batch)
    }

    /// Drives the book from its current phase to `Complete`.
    pub async fn run(&self, book: &mut StoryBook) -> GenResult<()> {
        loop {
            let phase = book.phase();
            debug!("Book {} at {:?}", book.id, phase);
            match phase {
                BookPhase::NoIdentity => {
                    println!("Drawing the character sheet...");
                    self.generate_sheet(book).await?;
                }
                BookPhase::SheetReady => {
                    println!("Painting the cover...");
                    self.generate_cover(book).await?;
                }
                p if p.accepts_pages() => {
                    let batch = self.generate_pages(book).await?;
                    if let Some((_, err)) = batch.failed.into_iter().next() {
                        return Err(err);
                    }
                }
                BookPhase::Complete => {
                    println!("'{}' is complete!", book.title);
                    return Ok(());
                }
                _ => {
                    return Err(anyhow!("Book {} is stuck in {:?}", book.id, phase).into());
                }
            }
        }
    }
}
