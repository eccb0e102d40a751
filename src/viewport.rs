//! Visibility-driven prioritization.
//!
//! A DOM-free intersection model: the host UI reports element and
//! viewport rectangles, the tracker reports which watched URLs just came
//! near (within the lead margin) or fully on-screen so the facade can
//! promote their fetches. Also owns the per-URL autoplay audio state
//! machine: attempt unmuted once, remember a policy rejection, play muted
//! from then on.

use dashmap::DashMap;
use std::sync::Mutex;
use tracing::debug;

/// Axis-aligned rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn expand(&self, margin: f64) -> Rect {
        Rect {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }

    fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// How far into view a watched element is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Within the lead margin: start loading now.
    Near,
    /// Intersecting the actual viewport: candidate for autoplay.
    Visible,
}

/// A watched URL that changed visibility on the last layout update.
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionEvent {
    pub url: String,
    pub visibility: Visibility,
}

/// Audio mode for a playback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackAudio {
    Unmuted,
    Muted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioPolicy {
    Untried,
    UnmutedAllowed,
    UnmutedRejected,
}

#[derive(Debug)]
struct Watch {
    url: String,
    rect: Rect,
    last: Option<Visibility>,
}

/// Tracks element/viewport intersection for mounted media elements.
/// Exactly one watch per element; re-observing replaces the old watch.
pub struct ViewportTracker {
    margin: f64,
    viewport: Mutex<Rect>,
    watches: DashMap<String, Watch>,
    audio: DashMap<String, AudioPolicy>,
}

impl ViewportTracker {
    pub fn new(margin: f64) -> Self {
        Self {
            margin,
            viewport: Mutex::new(Rect::new(0.0, 0.0, 0.0, 0.0)),
            watches: DashMap::new(),
            audio: DashMap::new(),
        }
    }

    /// Registers a watch for `element`. Re-observing an already-watched
    /// element is tolerated by replacing the watch rather than leaking a
    /// duplicate. Returns the current visibility so the caller can
    /// promote immediately when the element mounts near the viewport.
    pub fn observe(&self, element: &str, url: &str, rect: Rect) -> Option<Visibility> {
        let visibility = self.classify(&rect);
        if self.watches.contains_key(element) {
            debug!(element, "re-observe replaces existing watch");
        }
        self.watches.insert(
            element.to_string(),
            Watch {
                url: url.to_string(),
                rect,
                last: visibility,
            },
        );
        visibility
    }

    /// Tears down the watch for `element`. Every observe must be paired
    /// with one of these on the caller's unmount path.
    pub fn unobserve(&self, element: &str) {
        self.watches.remove(element);
    }

    /// Reports a layout move for one element. Returns an event when its
    /// visibility increased.
    pub fn set_element_rect(&self, element: &str, rect: Rect) -> Option<IntersectionEvent> {
        let mut watch = self.watches.get_mut(element)?;
        watch.rect = rect;
        let current = self.classify(&rect);
        Self::transition(&mut watch, current)
    }

    /// Reports a viewport change (scroll or resize). Returns events for
    /// every watch whose visibility increased.
    pub fn set_viewport(&self, viewport: Rect) -> Vec<IntersectionEvent> {
        match self.viewport.lock() {
            Ok(mut v) => *v = viewport,
            Err(poisoned) => *poisoned.into_inner() = viewport,
        }
        let mut events = Vec::new();
        for mut watch in self.watches.iter_mut() {
            let rect = watch.rect;
            let current = self.classify(&rect);
            if let Some(event) = Self::transition(&mut watch, current) {
                events.push(event);
            }
        }
        events
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Audio mode for the next playback attempt on `url`: unmuted until
    /// the browser has rejected it once, muted ever after.
    pub fn playback_attempt(&self, url: &str) -> PlaybackAudio {
        match self
            .audio
            .get(url)
            .map(|p| *p)
            .unwrap_or(AudioPolicy::Untried)
        {
            AudioPolicy::UnmutedRejected => PlaybackAudio::Muted,
            _ => PlaybackAudio::Unmuted,
        }
    }

    /// Records an autoplay-policy rejection so later intersections go
    /// straight to muted instead of thrashing every frame.
    pub fn playback_rejected(&self, url: &str) {
        debug!(url, "unmuted autoplay rejected, remembering muted fallback");
        self.audio
            .insert(url.to_string(), AudioPolicy::UnmutedRejected);
    }

    pub fn playback_succeeded(&self, url: &str) {
        self.audio
            .insert(url.to_string(), AudioPolicy::UnmutedAllowed);
    }

    pub fn clear(&self) {
        self.watches.clear();
        self.audio.clear();
    }

    fn classify(&self, rect: &Rect) -> Option<Visibility> {
        let viewport = match self.viewport.lock() {
            Ok(v) => *v,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if rect.intersects(&viewport) {
            Some(Visibility::Visible)
        } else if rect.intersects(&viewport.expand(self.margin)) {
            Some(Visibility::Near)
        } else {
            None
        }
    }

    fn transition(watch: &mut Watch, current: Option<Visibility>) -> Option<IntersectionEvent> {
        let increased = match (watch.last, current) {
            (None, Some(_)) => true,
            (Some(Visibility::Near), Some(Visibility::Visible)) => true,
            _ => false,
        };
        watch.last = current;
        if increased {
            current.map(|visibility| IntersectionEvent {
                url: watch.url.clone(),
                visibility,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ViewportTracker {
        let t = ViewportTracker::new(200.0);
        t.set_viewport(Rect::new(0.0, 0.0, 400.0, 800.0));
        t
    }

    #[test]
    fn observe_classifies_near_and_visible() {
        let t = tracker();
        assert_eq!(
            t.observe("el-1", "a.jpg", Rect::new(0.0, 100.0, 400.0, 300.0)),
            Some(Visibility::Visible)
        );
        assert_eq!(
            t.observe("el-2", "b.jpg", Rect::new(0.0, 900.0, 400.0, 300.0)),
            Some(Visibility::Near)
        );
        assert_eq!(
            t.observe("el-3", "c.jpg", Rect::new(0.0, 2000.0, 400.0, 300.0)),
            None
        );
    }

    #[test]
    fn scrolling_emits_events_only_on_increase() {
        let t = tracker();
        t.observe("el", "far.jpg", Rect::new(0.0, 2000.0, 400.0, 300.0));

        // Scroll down: the element comes within the lead margin.
        let events = t.set_viewport(Rect::new(0.0, 1100.0, 400.0, 800.0));
        assert_eq!(
            events,
            vec![IntersectionEvent {
                url: "far.jpg".to_string(),
                visibility: Visibility::Near
            }]
        );

        // Same viewport again: no repeat event.
        assert!(t.set_viewport(Rect::new(0.0, 1100.0, 400.0, 800.0)).is_empty());

        // Fully on-screen now.
        let events = t.set_viewport(Rect::new(0.0, 1900.0, 400.0, 800.0));
        assert_eq!(events[0].visibility, Visibility::Visible);
    }

    #[test]
    fn reobserve_replaces_instead_of_duplicating() {
        let t = tracker();
        t.observe("el", "a.jpg", Rect::new(0.0, 0.0, 10.0, 10.0));
        t.observe("el", "b.jpg", Rect::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(t.watch_count(), 1);
        t.unobserve("el");
        assert_eq!(t.watch_count(), 0);
    }

    #[test]
    fn element_move_reports_increase() {
        let t = tracker();
        t.observe("el", "a.jpg", Rect::new(0.0, 5000.0, 100.0, 100.0));
        let event = t.set_element_rect("el", Rect::new(0.0, 100.0, 100.0, 100.0));
        assert_eq!(event.map(|e| e.visibility), Some(Visibility::Visible));
    }

    #[test]
    fn autoplay_rejection_is_remembered() {
        let t = tracker();
        assert_eq!(t.playback_attempt("v.mp4"), PlaybackAudio::Unmuted);
        t.playback_rejected("v.mp4");
        assert_eq!(t.playback_attempt("v.mp4"), PlaybackAudio::Muted);
        // Another resource is unaffected.
        assert_eq!(t.playback_attempt("w.mp4"), PlaybackAudio::Unmuted);
    }

    #[test]
    fn autoplay_success_keeps_unmuted() {
        let t = tracker();
        t.playback_succeeded("v.mp4");
        assert_eq!(t.playback_attempt("v.mp4"), PlaybackAudio::Unmuted);
    }
}
