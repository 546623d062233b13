//! Display side of the background
//!
//! Painting and window management live outside this crate. The engine talks
//! to a window through [`DisplaySurface`]; additional screens run a
//! [`DisplayObserver`] that follows the engine's broadcasts and renders from
//! the shared cache without ever touching the network.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, watch};
use utoipa::ToSchema;

use crate::cache::{CacheStore, ImageId};
use crate::catalog::ImageMetadata;
use crate::error::CacheError;
use crate::settings::{BackgroundSource, DisplayOptions, StretchStyle};

/// Which edge of the screen the attribution labels sit on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LabelEdge {
    Top,
    Bottom,
}

/// Attribution text drawn over a community background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LabelOverlay {
    pub title: Option<String>,
    pub location: Option<String>,
    /// "by <author>"
    pub attribution: Option<String>,
    pub edge: LabelEdge,
}

impl LabelOverlay {
    pub fn from_metadata(metadata: &ImageMetadata, options: &DisplayOptions) -> Option<Self> {
        if !options.show_labels {
            return None;
        }

        // Labels go on the edge away from the panel
        let edge = if options.bar_on_top {
            LabelEdge::Bottom
        } else {
            LabelEdge::Top
        };

        Some(Self {
            title: metadata.name.clone(),
            location: metadata.location.clone(),
            attribution: metadata.author.as_ref().map(|a| format!("by {}", a)),
            edge,
        })
    }
}

/// Everything a window needs to paint a community background
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BackgroundFrame {
    pub image_id: ImageId,
    #[schema(value_type = String)]
    pub image_path: PathBuf,
    #[schema(value_type = Object)]
    pub metadata: ImageMetadata,
    pub stretch: StretchStyle,
    pub labels: Option<LabelOverlay>,
}

impl BackgroundFrame {
    /// Build a frame from cached files; fails if either file is unusable
    pub fn load(
        cache: &CacheStore,
        image_id: &ImageId,
        options: &DisplayOptions,
    ) -> Result<Self, CacheError> {
        let image_path = cache.image_path(image_id);
        if !image_path.is_file() {
            return Err(CacheError::io(
                image_path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let metadata = cache.read_metadata(image_id)?;
        Ok(Self {
            image_id: image_id.clone(),
            image_path,
            labels: LabelOverlay::from_metadata(&metadata, options),
            metadata,
            stretch: options.stretch,
        })
    }
}

/// A window showing the desktop background
pub trait DisplaySurface: Send {
    /// Flag the window as the desktop window; called once before first show
    fn mark_as_desktop(&mut self) {}

    fn render_community(&mut self, frame: &BackgroundFrame);

    /// Built-in art or a user file; painting it is up to the window
    fn render_static(&mut self, source: &BackgroundSource, stretch: StretchStyle);

    /// No background can be shown at all
    fn show_unavailable(&mut self, message: &str);
}

/// Selection broadcast from the engine to observer displays
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundChanged {
    Community { image_id: ImageId },
    Static(BackgroundSource),
    Unavailable(String),
}

/// A non-getter display that mirrors the engine's choice
pub struct DisplayObserver<S: DisplaySurface> {
    cache: CacheStore,
    options: DisplayOptions,
    surface: S,
    updates: broadcast::Receiver<BackgroundChanged>,
    current: Option<ImageId>,
}

impl<S: DisplaySurface> DisplayObserver<S> {
    pub fn new(
        cache: CacheStore,
        options: DisplayOptions,
        surface: S,
        updates: broadcast::Receiver<BackgroundChanged>,
    ) -> Self {
        Self {
            cache,
            options,
            surface,
            updates,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&ImageId> {
        self.current.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn show(&mut self) {
        self.surface.mark_as_desktop();
    }

    /// Render a static source locally; community sources wait for the engine
    pub fn refresh_background(&mut self, source: &BackgroundSource) {
        if *source != BackgroundSource::Community {
            self.surface.render_static(source, self.options.stretch);
        }
    }

    pub fn apply(&mut self, change: BackgroundChanged) {
        match change {
            BackgroundChanged::Community { image_id } => {
                match BackgroundFrame::load(&self.cache, &image_id, &self.options) {
                    Ok(frame) => {
                        self.surface.render_community(&frame);
                        self.current = Some(image_id);
                    }
                    Err(e) => {
                        tracing::warn!("Observer cannot show {}: {}", image_id, e);
                    }
                }
            }
            BackgroundChanged::Static(source) => {
                self.current = None;
                self.surface.render_static(&source, self.options.stretch);
            }
            BackgroundChanged::Unavailable(message) => {
                self.current = None;
                self.surface.show_unavailable(&message);
            }
        }
    }

    /// Apply every broadcast already queued; returns how many were applied
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.updates.try_recv() {
                Ok(change) => {
                    self.apply(change);
                    applied += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Observer lagged by {} updates", n);
                }
                Err(_) => return applied,
            }
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.updates.recv().await {
                Ok(change) => self.apply(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Observer lagged by {} updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("Background engine gone, observer exiting");
                    return;
                }
            }
        }
    }
}

/// What a screen currently shows
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScreenState {
    Blank,
    Community {
        frame: BackgroundFrame,
    },
    Static {
        source: String,
        stretch: StretchStyle,
    },
    Unavailable {
        message: String,
    },
}

/// Surface that publishes each screen's state for the control API
pub struct ScreenSurface {
    index: usize,
    state: watch::Sender<ScreenState>,
}

impl ScreenSurface {
    pub fn new(index: usize) -> (Self, watch::Receiver<ScreenState>) {
        let (state, rx) = watch::channel(ScreenState::Blank);
        (Self { index, state }, rx)
    }
}

impl DisplaySurface for ScreenSurface {
    fn mark_as_desktop(&mut self) {
        tracing::info!("Screen {} shown as desktop window", self.index);
    }

    fn render_community(&mut self, frame: &BackgroundFrame) {
        tracing::info!("Screen {} showing community background {}", self.index, frame.image_id);
        self.state.send_replace(ScreenState::Community {
            frame: frame.clone(),
        });
    }

    fn render_static(&mut self, source: &BackgroundSource, stretch: StretchStyle) {
        tracing::info!("Screen {} showing {}", self.index, source);
        self.state.send_replace(ScreenState::Static {
            source: source.to_string(),
            stretch,
        });
    }

    fn show_unavailable(&mut self, message: &str) {
        tracing::warn!("Screen {}: {}", self.index, message);
        self.state.send_replace(ScreenState::Unavailable {
            message: message.to_string(),
        });
    }
}

/// Surface that records every call, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub marked: bool,
    pub frames: Vec<BackgroundFrame>,
    pub statics: Vec<BackgroundSource>,
    pub errors: Vec<String>,
}

#[cfg(test)]
impl RecordingSurface {
    pub fn last_image(&self) -> Option<&ImageId> {
        self.frames.last().map(|f| &f.image_id)
    }
}

#[cfg(test)]
impl DisplaySurface for RecordingSurface {
    fn mark_as_desktop(&mut self) {
        self.marked = true;
    }

    fn render_community(&mut self, frame: &BackgroundFrame) {
        self.frames.push(frame.clone());
    }

    fn render_static(&mut self, source: &BackgroundSource, _stretch: StretchStyle) {
        self.statics.push(source.clone());
    }

    fn show_unavailable(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_cache() -> (tempfile::TempDir, CacheStore, ImageId) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        cache.ensure_dirs().unwrap();
        let id = ImageId::parse("harbour").unwrap();
        cache
            .write_metadata(
                &id,
                br#"{"filename":"harbour.jpg","name":"Harbour","location":"Hobart","author":"Kim"}"#,
            )
            .unwrap();
        cache.write_image_file(&id, b"\xFF\xD8\xFF").unwrap();
        (dir, cache, id)
    }

    #[test]
    fn test_labels_follow_settings() {
        let metadata = ImageMetadata::from_slice(
            br#"{"filename":"harbour.jpg","name":"Harbour","author":"Kim"}"#,
        )
        .unwrap();

        let labels = LabelOverlay::from_metadata(&metadata, &DisplayOptions::default()).unwrap();
        assert_eq!(labels.title.as_deref(), Some("Harbour"));
        assert_eq!(labels.location, None);
        assert_eq!(labels.attribution.as_deref(), Some("by Kim"));
        assert_eq!(labels.edge, LabelEdge::Top);

        let bar_on_top = DisplayOptions {
            bar_on_top: true,
            ..DisplayOptions::default()
        };
        assert_eq!(
            LabelOverlay::from_metadata(&metadata, &bar_on_top).unwrap().edge,
            LabelEdge::Bottom
        );

        let hidden = DisplayOptions {
            show_labels: false,
            ..DisplayOptions::default()
        };
        assert!(LabelOverlay::from_metadata(&metadata, &hidden).is_none());
    }

    #[test]
    fn test_frame_requires_image_file() {
        let (_dir, cache, id) = seeded_cache();
        let frame = BackgroundFrame::load(&cache, &id, &DisplayOptions::default()).unwrap();
        assert_eq!(frame.image_path, cache.image_path(&id));
        assert_eq!(frame.metadata.location.as_deref(), Some("Hobart"));

        let missing = ImageId::parse("missing").unwrap();
        assert!(BackgroundFrame::load(&cache, &missing, &DisplayOptions::default()).is_err());
    }

    #[test]
    fn test_observer_follows_broadcasts() {
        let (_dir, cache, id) = seeded_cache();
        let (tx, rx) = broadcast::channel(8);
        let mut observer =
            DisplayObserver::new(cache, DisplayOptions::default(), RecordingSurface::default(), rx);

        tx.send(BackgroundChanged::Community { image_id: id.clone() }).unwrap();
        tx.send(BackgroundChanged::Community {
            image_id: ImageId::parse("gone").unwrap(),
        })
        .unwrap();
        assert_eq!(observer.drain_pending(), 2);

        // The unknown image is skipped and the previous one stays up
        assert_eq!(observer.current(), Some(&id));
        assert_eq!(observer.surface().frames.len(), 1);

        tx.send(BackgroundChanged::Unavailable("offline".to_string())).unwrap();
        observer.drain_pending();
        assert_eq!(observer.current(), None);
        assert_eq!(observer.surface().errors, vec!["offline".to_string()]);
    }

    #[test]
    fn test_observer_renders_static_sources_locally() {
        let (_dir, cache, _id) = seeded_cache();
        let (_tx, rx) = broadcast::channel(8);
        let mut observer =
            DisplayObserver::new(cache, DisplayOptions::default(), RecordingSurface::default(), rx);

        observer.show();
        observer.refresh_background(&BackgroundSource::Community);
        observer.refresh_background(&BackgroundSource::Inbuilt("triangles".to_string()));

        assert!(observer.surface().marked);
        assert_eq!(
            observer.surface().statics,
            vec![BackgroundSource::Inbuilt("triangles".to_string())]
        );
    }

    #[test]
    fn test_screen_surface_publishes_state() {
        let (_dir, cache, id) = seeded_cache();
        let (mut surface, rx) = ScreenSurface::new(1);
        assert_eq!(*rx.borrow(), ScreenState::Blank);

        let frame = BackgroundFrame::load(&cache, &id, &DisplayOptions::default()).unwrap();
        surface.render_community(&frame);
        assert!(matches!(&*rx.borrow(), ScreenState::Community { frame } if frame.image_id == id));

        surface.show_unavailable("nothing cached");
        assert_eq!(
            *rx.borrow(),
            ScreenState::Unavailable {
                message: "nothing cached".to_string()
            }
        );
    }
}
