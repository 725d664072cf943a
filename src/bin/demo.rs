// Demo: a simulated browse session over a folder of images.
// Enqueues thumbnail ranges at both priorities, scrolls (dropping stale work),
// preloads full-resolution neighbours, and persists ratings in a temp catalog.
//
// Usage: demo [item_count]

use std::num::NonZeroUsize;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use lightbox_core::{
    BoundedLruCache, CancellationToken, ConcurrentStore, ImageLoader, ItemProcessor, LoadError,
    ProcessError, RequestScheduler, SlidingWindowCache, ThumbnailRequest, WindowItem,
};

struct DemoItem {
    key: String,
    image: bool,
}

impl WindowItem for DemoItem {
    fn cache_key(&self) -> &str {
        &self.key
    }
    fn is_cacheable(&self) -> bool {
        self.image
    }
}

struct DemoLoader;

impl ImageLoader for DemoLoader {
    type Image = Vec<u8>;

    fn load(&self, key: &str) -> Result<Vec<u8>, LoadError> {
        // Pretend to decode a full-resolution image.
        std::thread::sleep(Duration::from_millis(2));
        Ok(key.as_bytes().to_vec())
    }
}

struct DemoProcessor {
    thumbs: std::sync::Mutex<BoundedLruCache<usize, Vec<u8>>>,
}

impl ItemProcessor for DemoProcessor {
    fn process_item(
        &self,
        index: usize,
        token: CancellationToken,
    ) -> BoxFuture<'_, Result<(), ProcessError>> {
        async move {
            if token.is_cancelled() {
                return Ok(());
            }
            // Pretend to decode and resize.
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.thumbs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add(index, vec![(index % 256) as u8; 64]);
            Ok(())
        }
        .boxed()
    }
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let item_count: usize = match args.next() {
        Some(val) => match val.parse() {
            Ok(n) if n > 0 => n,
            _ => {
                eprintln!("item_count must be a positive integer");
                process::exit(1);
            }
        },
        None => 200,
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    rt.block_on(async move {
        let items: Vec<DemoItem> = (0..item_count)
            .map(|i| DemoItem {
                key: format!("IMG_{i:05}.RAW"),
                // Every 10th item is a video clip.
                image: i % 10 != 0,
            })
            .collect();

        let processor = Arc::new(DemoProcessor {
            thumbs: std::sync::Mutex::new(BoundedLruCache::new(
                NonZeroUsize::new(500).expect("nonzero"),
            )),
        });
        let scheduler = RequestScheduler::new(Arc::clone(&processor) as Arc<dyn ItemProcessor>);

        println!("Browsing {} items", item_count);

        // Visible grid first, rest of the folder in the background.
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let visible_tx = done_tx.clone();
        let visible_cb: lightbox_core::CompletionCallback = Box::new(move |req, ok| {
            let _ = visible_tx.send((req.start(), req.end(), ok));
        });
        scheduler.enqueue(ThumbnailRequest::new(
            0,
            29.min(item_count - 1),
            true,
            CancellationToken::new(),
            Some(visible_cb),
        ));
        if item_count > 30 {
            let rest_cb: lightbox_core::CompletionCallback = Box::new(move |req, ok| {
                let _ = done_tx.send((req.start(), req.end(), ok));
            });
            scheduler.enqueue(ThumbnailRequest::new(
                30,
                item_count - 1,
                false,
                CancellationToken::new(),
                Some(rest_cb),
            ));
        }

        // User starts scrolling: stale background work is dropped.
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.set_scrolling(true);
        println!("Scrolling... (normal-priority queue dropped)");
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.set_scrolling(false);

        // Landed on item 50: re-request the new viewport at high priority.
        let viewport_end = 79.min(item_count - 1);
        scheduler.enqueue(ThumbnailRequest::new(
            50.min(item_count - 1),
            viewport_end,
            true,
            CancellationToken::new(),
            None,
        ));

        while let Ok(Some((start, end, ok))) =
            tokio::time::timeout(Duration::from_secs(10), done_rx.recv()).await
        {
            println!(
                "Request [{start}, {end}] {}",
                if ok { "completed" } else { "was dropped" }
            );
            if start == 0 {
                break;
            }
        }

        // Full-resolution preloads around the current position.
        let mut window = SlidingWindowCache::new(DemoLoader, 3, 3);
        window.update_cache(&items, 50.min(item_count - 1));
        println!("Preloaded {} full-resolution neighbours", window.len());

        // Rate the current image and read it back from the catalog.
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Failed to create temp dir: {}", e);
                process::exit(1);
            }
        };
        let store = ConcurrentStore::open(dir.path().join("catalog.db"));
        let token = CancellationToken::new();
        let rated = async {
            store
                .write(&token, |conn| {
                    conn.execute(
                        "CREATE TABLE IF NOT EXISTS ratings \
                         (path TEXT PRIMARY KEY, stars INTEGER NOT NULL)",
                        [],
                    )
                    .map(|_| ())
                })
                .await?;
            store
                .write(&token, |conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO ratings (path, stars) VALUES ('IMG_00050.RAW', 5)",
                        [],
                    )
                    .map(|_| ())
                })
                .await?;
            store
                .read(&token, |conn| {
                    conn.query_row(
                        "SELECT stars FROM ratings WHERE path = 'IMG_00050.RAW'",
                        [],
                        |row| row.get::<_, i64>(0),
                    )
                })
                .await
        }
        .await;
        match rated {
            Ok(stars) => println!("IMG_00050.RAW rated {} stars", stars),
            Err(e) => {
                eprintln!("Catalog error: {}", e);
                process::exit(1);
            }
        }

        let stats = scheduler.stats();
        println!(
            "Scheduler idle: high={} normal={} processing={}",
            stats.high_queued, stats.normal_queued, stats.processing
        );
        scheduler.shutdown();
    });
}
