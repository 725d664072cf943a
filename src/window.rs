// Sliding-window preload cache module
// Keeps full-resolution images for the items around the user's current position
// so stepping forward/backward never waits on a decode. Pruning is exact: after
// an update the cache holds the window contents and nothing else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("decode failed for {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplies decoded images by key. Implemented by the host's decode pipeline;
/// loads are synchronous because a direct request must surface its error.
pub trait ImageLoader: Send + Sync {
    type Image;

    fn load(&self, key: &str) -> Result<Self::Image, LoadError>;
}

/// One entry of the browsed list, as seen by the preloader. `is_cacheable`
/// is the externally supplied predicate (e.g. images yes, videos no).
pub trait WindowItem {
    fn cache_key(&self) -> &str;
    fn is_cacheable(&self) -> bool;
}

/// Cache of decoded images for positions within
/// `[current - backward, current + forward]`, clamped to the list bounds.
///
/// Not internally synchronized; the owner (typically the single scheduler
/// worker) serializes access.
pub struct SlidingWindowCache<L: ImageLoader> {
    forward: usize,
    backward: usize,
    loader: L,
    cache: HashMap<String, Arc<L::Image>>,
}

impl<L: ImageLoader> SlidingWindowCache<L> {
    pub fn new(loader: L, forward: usize, backward: usize) -> Self {
        Self {
            forward,
            backward,
            loader,
            cache: HashMap::new(),
        }
    }

    /// Adjust the window extents; takes effect on the next `update_cache`.
    pub fn set_window(&mut self, forward: usize, backward: usize) {
        self.forward = forward;
        self.backward = backward;
    }

    /// Re-center the window on `current`.
    ///
    /// Every cached key outside the new window (or no longer cacheable) is
    /// evicted. Missing in-window items are loaded through the loader; a load
    /// failure is logged and the item simply stays uncached. If the current
    /// item itself is not cacheable the cache is still pruned but nothing new
    /// is loaded; the view is presumably on a video or similar.
    pub fn update_cache<T: WindowItem>(&mut self, items: &[T], current: usize) {
        if items.is_empty() {
            self.cache.clear();
            return;
        }
        let current = current.min(items.len() - 1);
        let lo = current.saturating_sub(self.backward);
        let hi = (current + self.forward).min(items.len() - 1);

        let keep: HashSet<&str> = items[lo..=hi]
            .iter()
            .filter(|item| item.is_cacheable())
            .map(|item| item.cache_key())
            .collect();

        self.cache.retain(|key, _| keep.contains(key.as_str()));

        if !items[current].is_cacheable() {
            debug!(
                "window update at {current}: current item not cacheable, pruned to {} entries",
                self.cache.len()
            );
            return;
        }

        for item in items[lo..=hi].iter().filter(|i| i.is_cacheable()) {
            let key = item.cache_key();
            if self.cache.contains_key(key) {
                continue; // already preloaded, never load twice
            }
            match self.loader.load(key) {
                Ok(image) => {
                    self.cache.insert(key.to_string(), Arc::new(image));
                }
                Err(e) => {
                    warn!("preload failed for {key}: {e}");
                }
            }
        }
        debug!(
            "window update at {current}: [{lo}, {hi}], {} cached",
            self.cache.len()
        );
    }

    /// Fetch one image. A hit is returned directly; a miss is loaded
    /// synchronously and inserted. Unlike background preloading, a direct
    /// request propagates its load error.
    pub fn get_image(&mut self, key: &str) -> Result<Arc<L::Image>, LoadError> {
        if let Some(image) = self.cache.get(key) {
            return Ok(Arc::clone(image));
        }
        let image = Arc::new(self.loader.load(key)?);
        self.cache.insert(key.to_string(), Arc::clone(&image));
        Ok(image)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Item {
        key: String,
        image: bool,
    }

    impl Item {
        fn img(key: &str) -> Self {
            Self { key: key.into(), image: true }
        }
        fn video(key: &str) -> Self {
            Self { key: key.into(), image: false }
        }
    }

    impl WindowItem for Item {
        fn cache_key(&self) -> &str {
            &self.key
        }
        fn is_cacheable(&self) -> bool {
            self.image
        }
    }

    /// Loader returning the key as the "image"; records load calls and can be
    /// told to fail specific keys.
    struct StubLoader {
        loads: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl StubLoader {
        fn new() -> Self {
            Self { loads: Mutex::new(Vec::new()), failing: Vec::new() }
        }
        fn failing(keys: &[&str]) -> Self {
            Self {
                loads: Mutex::new(Vec::new()),
                failing: keys.iter().map(|k| k.to_string()).collect(),
            }
        }
        fn load_count(&self) -> usize {
            self.loads.lock().unwrap().len()
        }
    }

    impl ImageLoader for StubLoader {
        type Image = String;

        fn load(&self, key: &str) -> Result<String, LoadError> {
            self.loads.lock().unwrap().push(key.to_string());
            if self.failing.iter().any(|k| k == key) {
                Err(LoadError::NotFound(key.to_string()))
            } else {
                Ok(format!("pixels:{key}"))
            }
        }
    }

    fn ten_images() -> Vec<Item> {
        (0..10).map(|i| Item::img(&format!("img{i}"))).collect()
    }

    #[test]
    fn window_is_exact_and_clamped() {
        let items = ten_images();
        let mut cache = SlidingWindowCache::new(StubLoader::new(), 3, 3);

        cache.update_cache(&items, 5);
        // [2, 8]
        assert_eq!(cache.len(), 7);
        for i in 2..=8 {
            assert!(cache.contains(&format!("img{i}")), "img{i} should be cached");
        }
        assert!(!cache.contains("img1"));
        assert!(!cache.contains("img9"));

        // Clamp at the low end: [0, 4]
        cache.update_cache(&items, 1);
        assert_eq!(cache.len(), 5);
        assert!(cache.contains("img0"));
        assert!(cache.contains("img4"));
        assert!(!cache.contains("img5"));

        // Clamp at the high end: [6, 9]
        cache.update_cache(&items, 9);
        assert_eq!(cache.len(), 4);
        assert!(cache.contains("img6"));
        assert!(cache.contains("img9"));
    }

    #[test]
    fn in_window_items_loaded_once() {
        let items = ten_images();
        let mut cache = SlidingWindowCache::new(StubLoader::new(), 2, 2);
        cache.update_cache(&items, 4);
        let first = cache.loader.load_count();
        assert_eq!(first, 5);
        // Shift by one: only the newly entering item loads.
        cache.update_cache(&items, 5);
        assert_eq!(cache.loader.load_count(), first + 1);
    }

    #[test]
    fn non_cacheable_items_are_skipped() {
        let items = vec![
            Item::img("a"),
            Item::video("clip"),
            Item::img("b"),
        ];
        let mut cache = SlidingWindowCache::new(StubLoader::new(), 1, 1);
        cache.update_cache(&items, 0);
        assert!(cache.contains("a"));
        assert!(!cache.contains("clip"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn current_item_not_cacheable_prunes_without_loading() {
        let items = vec![
            Item::img("a"),
            Item::img("b"),
            Item::video("clip"),
            Item::img("c"),
        ];
        let mut cache = SlidingWindowCache::new(StubLoader::new(), 1, 1);
        cache.update_cache(&items, 0); // loads a, b
        assert_eq!(cache.loader.load_count(), 2);

        cache.update_cache(&items, 2); // on the video: window keys {b, c}, of which only b is cached
        assert_eq!(cache.loader.load_count(), 2, "no loads while on a video");
        assert!(cache.contains("b"));
        assert!(!cache.contains("a"));
        assert!(!cache.contains("c"));
    }

    #[test]
    fn preload_failure_is_skipped() {
        let items = ten_images();
        let mut cache = SlidingWindowCache::new(StubLoader::failing(&["img3"]), 1, 1);
        cache.update_cache(&items, 3);
        assert!(!cache.contains("img3"));
        assert!(cache.contains("img2"));
        assert!(cache.contains("img4"));
    }

    #[test]
    fn get_image_loads_on_miss_and_propagates_failure() {
        let mut cache = SlidingWindowCache::new(StubLoader::failing(&["bad"]), 1, 1);
        let image = cache.get_image("good").unwrap();
        assert_eq!(*image, "pixels:good");
        assert!(cache.contains("good"));
        // Hit path: no second load.
        let _ = cache.get_image("good").unwrap();
        assert_eq!(cache.loader.load_count(), 1);

        assert!(matches!(cache.get_image("bad"), Err(LoadError::NotFound(_))));
        assert!(!cache.contains("bad"));
        assert_eq!(cache.loader.load_count(), 2);
    }

    #[test]
    fn empty_list_clears_cache() {
        let items = ten_images();
        let mut cache = SlidingWindowCache::new(StubLoader::new(), 2, 2);
        cache.update_cache(&items, 0);
        assert!(!cache.is_empty());
        cache.update_cache(&[] as &[Item], 0);
        assert!(cache.is_empty());
    }
}
