use crate::cancel::CancellationToken;
use crate::chunk::Chunk;
use crate::error::Error;
use crate::index::builder::OctreeBuilder;
use crate::index::lod::LodGenerator;
use crate::index::merge::MergeEngine;
use crate::index::node::Node;
use crate::index::normals::{NormalEstimator, NormalGenerator};
use crate::index::sampling::{ChunkPipeline, Reprojection};
use crate::index::PointSet;
use crate::store::Storage;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Options of one import run. `Default` gives the stock settings; the
/// storage is passed to [import_chunks] separately since every run needs
/// one.
#[derive(Clone)]
pub struct ImportConfig {
    /// Key under which the final [PointSet] handle is stored. Generated
    /// when absent.
    pub key: Option<String>,
    /// Maximum number of points stored directly at a leaf.
    pub split_limit: usize,
    /// Poisson thinning radius; 0 disables.
    pub min_dist: f64,
    /// Pure per-point position transform applied before building.
    pub reproject: Option<Reprojection>,
    /// When set, normals are estimated for every node lacking them.
    pub estimate_normals: Option<Arc<dyn NormalEstimator>>,
    /// Run the lod pass after construction.
    pub create_octree_lod: bool,
    /// Drop chunks whose content hash was already imported in this run.
    pub deduplicate_chunks: bool,
    /// Upper bound on worker concurrency.
    pub max_degree_of_parallelism: usize,
    /// Monotone progress reporter over `[0, 1]`.
    pub progress: Option<ProgressCallback>,
    /// Emit status via the `log` crate.
    pub verbose: bool,
    pub cancel: CancellationToken,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            key: None,
            split_limit: 8192,
            min_dist: 0.0,
            reproject: None,
            estimate_normals: None,
            create_octree_lod: true,
            deduplicate_chunks: false,
            max_degree_of_parallelism: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
            progress: None,
            verbose: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// Monotone progress: late or out-of-order reports never move backwards.
struct Progress {
    callback: Option<ProgressCallback>,
    best: Mutex<f64>,
}

impl Progress {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Progress {
            callback,
            best: Mutex::new(0.0),
        }
    }

    fn report(&self, value: f64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let value = value.clamp(0.0, 1.0);
        let mut best = self.best.lock().unwrap();
        if value > *best {
            *best = value;
            callback(value);
        }
    }
}

/// Runs `f` over the items on up to `workers` threads, returning the
/// results in input order.
fn run_parallel<T, R, F>(items: Vec<T>, workers: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let n = items.len();
    if workers <= 1 || n <= 1 {
        return items.into_iter().map(f).collect();
    }
    let (task_tx, task_rx) = crossbeam_channel::unbounded::<(usize, T)>();
    for task in items.into_iter().enumerate() {
        task_tx.send(task).expect("queue is open");
    }
    drop(task_tx);
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, R)>();
    crossbeam_utils::thread::scope(|scope| {
        for _ in 0..workers.min(n) {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let f = &f;
            scope.spawn(move |_| {
                for (index, item) in task_rx.iter() {
                    result_tx
                        .send((index, f(item)))
                        .expect("collector outlives workers");
                }
            });
        }
        drop(result_tx);
        let mut results: Vec<Option<R>> = (0..n).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            results[index] = Some(result);
        }
        results
            .into_iter()
            .map(|slot| slot.expect("one result per task"))
            .collect()
    })
    .expect("worker thread panicked")
}

/// Imports a set of chunks into one octree: map every chunk through the
/// pipeline and the per-chunk builder, reduce the per-chunk trees pairwise
/// through the merge engine, then run the optional normal and lod passes
/// and persist the named handle. Mapping reports progress up to 0.5,
/// reducing up to 1.0.
pub fn import_chunks(
    storage: &Storage,
    chunks: Vec<Chunk>,
    config: &ImportConfig,
) -> Result<PointSet, Error> {
    if config.split_limit == 0 {
        return Err(Error::invalid_input("split_limit must be positive"));
    }
    if config.max_degree_of_parallelism == 0 {
        return Err(Error::invalid_input(
            "max_degree_of_parallelism must be positive",
        ));
    }
    let pipeline = ChunkPipeline::new(config.reproject.clone(), config.min_dist)?;
    let progress = Progress::new(config.progress.clone());
    let workers = config.max_degree_of_parallelism;

    let chunks = if config.deduplicate_chunks {
        let mut seen = HashSet::new();
        let before = chunks.len();
        let deduplicated: Vec<Chunk> = chunks
            .into_iter()
            .filter(|chunk| seen.insert(chunk.content_hash()))
            .collect();
        if config.verbose {
            log::info!(
                "deduplicated {} of {before} chunks",
                before - deduplicated.len()
            );
        }
        deduplicated
    } else {
        chunks
    };

    // map: one octree per chunk
    let total_chunks = chunks.len().max(1);
    let mapped = AtomicUsize::new(0);
    if config.verbose {
        log::info!("building {} chunk trees", chunks.len());
    }
    let roots: Vec<Result<Arc<Node>, Error>> = run_parallel(chunks, workers, |chunk| {
        config.cancel.check()?;
        let processed = pipeline.process(&chunk)?;
        let builder = OctreeBuilder::new(storage, config.split_limit, config.cancel.clone());
        let root = builder.build_chunk(&processed)?;
        let done = mapped.fetch_add(1, Ordering::Relaxed) + 1;
        progress.report(0.5 * done as f64 / total_chunks as f64);
        Ok(root)
    });
    let mut queue = Vec::with_capacity(roots.len());
    for root in roots {
        let root = root?;
        // chunks that thinned down to nothing contribute no tree
        if root.point_count_tree()? > 0 {
            queue.push(root);
        }
    }
    progress.report(0.5);

    // reduce: pairwise merges until one tree remains
    let total_merges = queue.len().saturating_sub(1).max(1);
    let merged_count = AtomicUsize::new(0);
    while queue.len() > 1 {
        config.cancel.check()?;
        if config.verbose {
            log::info!("reducing {} trees", queue.len());
        }
        let mut pairs = Vec::new();
        let mut carry = None;
        let mut iter = queue.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => pairs.push((a, b)),
                None => carry = Some(a),
            }
        }
        let merged: Vec<Result<Arc<Node>, Error>> = run_parallel(pairs, workers, |(a, b)| {
            config.cancel.check()?;
            let engine = MergeEngine::new(storage, config.split_limit, config.cancel.clone());
            let root = engine.merge(a, b)?;
            let done = merged_count.fetch_add(1, Ordering::Relaxed) + 1;
            progress.report(0.5 + 0.5 * done as f64 / total_merges as f64);
            Ok(root)
        });
        queue = merged.into_iter().collect::<Result<Vec<_>, _>>()?;
        queue.extend(carry);
    }

    let mut root = match queue.pop() {
        Some(root) => root,
        None => {
            // nothing to import: persist an empty tree
            OctreeBuilder::new(storage, config.split_limit, config.cancel.clone()).empty_node()?
        }
    };

    if let Some(estimator) = &config.estimate_normals {
        if config.verbose {
            log::info!("estimating normals");
        }
        root = NormalGenerator::new(storage, Arc::clone(estimator), config.cancel.clone())
            .generate(root)?;
    }
    if config.create_octree_lod {
        if config.verbose {
            log::info!("generating lod samples");
        }
        root = LodGenerator::new(storage, config.split_limit, config.cancel.clone())
            .generate(root)?;
    }

    let key = config
        .key
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let point_set = PointSet::create(storage, &key, &root, config.split_limit)?;
    progress.report(1.0);
    if config.verbose {
        log::info!(
            "imported {} points as {key}",
            point_set.point_count().unwrap_or(0)
        );
    }
    Ok(point_set)
}

#[cfg(test)]
mod tests {
    use super::{import_chunks, ImportConfig};
    use crate::cancel::CancellationToken;
    use crate::chunk::Chunk;
    use crate::error::Error;
    use crate::index::normals::NormalEstimator;
    use crate::index::PointSet;
    use crate::store::memory::InMemoryBlobStore;
    use crate::store::Storage;
    use nalgebra::{Point3, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Mutex};

    fn storage() -> Storage {
        Storage::new(Arc::new(InMemoryBlobStore::new()))
    }

    fn random_positions(n: usize, offset: f64, seed: u64) -> Vec<Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3::new(
                    rng.gen::<f64>() + offset,
                    rng.gen::<f64>() + offset,
                    rng.gen::<f64>() + offset,
                )
            })
            .collect()
    }

    fn sorted_bits(points: &[Point3<f64>]) -> Vec<(u64, u64, u64)> {
        let mut keys: Vec<_> = points
            .iter()
            .map(|p| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits()))
            .collect();
        keys.sort_unstable();
        keys
    }

    use crate::index::testing::assert_same_point_multiset;

    #[test]
    fn trivial_build_single_leaf() {
        let storage = storage();
        let chunk = Chunk::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ]);
        let config = ImportConfig {
            split_limit: 10,
            ..Default::default()
        };
        let set = import_chunks(&storage, vec![chunk], &config).unwrap();
        assert_eq!(set.point_count().unwrap(), 3);
        let root = set.root().unwrap();
        let points = root.as_points().unwrap();
        assert!(points.is_leaf());
        let bounds = points.bounding_box().unwrap();
        assert_eq!(bounds.min(), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(bounds.max(), Point3::new(2.0, 0.0, 0.0));
        assert!(points.normals().unwrap().is_none());
    }

    #[test]
    fn min_dist_thinning_during_import() {
        let storage = storage();
        let chunk = Chunk::new(random_positions(100, 0.0, 1));
        let config = ImportConfig {
            split_limit: 10,
            min_dist: 0.5,
            ..Default::default()
        };
        let set = import_chunks(&storage, vec![chunk], &config).unwrap();
        assert!(set.point_count().unwrap() < 100);
        assert!(set.point_count().unwrap() > 0);
        let kept = set.enumerate_points().unwrap();
        // the thinning guarantee holds in the original coordinates; the
        // stored positions may shift by the f32 relative encoding
        for i in 0..kept.len() {
            for j in i + 1..kept.len() {
                assert!((kept[i] - kept[j]).norm() >= 0.5 - 1e-6);
            }
        }
    }

    #[test]
    fn reprojection_moves_the_bounding_box() {
        let storage = storage();
        let chunk = Chunk::new((0..10).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect());
        let config = ImportConfig {
            split_limit: 100,
            reproject: Some(Arc::new(|p: Point3<f64>| {
                p + Vector3::new(0.0, 1.0, 0.0)
            })),
            ..Default::default()
        };
        let set = import_chunks(&storage, vec![chunk], &config).unwrap();
        let root = set.root().unwrap();
        let bounds = root.as_points().unwrap().bounding_box().unwrap();
        assert_eq!(bounds.min(), Point3::new(0.0, 1.0, 0.0));
        assert_eq!(bounds.max(), Point3::new(9.0, 1.0, 0.0));
    }

    #[test]
    fn normal_estimator_runs_on_import() {
        let storage = storage();
        let chunk = Chunk::new((0..10).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect());
        let estimator: Arc<dyn NormalEstimator> =
            Arc::new(|positions: &[Point3<f64>]| {
                vec![Vector3::new(0.0f32, 0.0, 1.0); positions.len()]
            });
        let config = ImportConfig {
            split_limit: 100,
            estimate_normals: Some(estimator),
            ..Default::default()
        };
        let set = import_chunks(&storage, vec![chunk], &config).unwrap();
        let root = set.root().unwrap();
        let points = root.as_points().unwrap();
        assert!(points.is_leaf());
        let normals = points.normals().unwrap().unwrap();
        assert_eq!(normals.len(), 10);
        assert!(normals.iter().all(|n| *n == Vector3::new(0.0, 0.0, 1.0)));
    }

    #[test]
    fn merge_of_two_chunk_trees() {
        let storage = storage();
        let pos_a = random_positions(42_000, 0.0, 2);
        let pos_b = random_positions(42_000, 0.3, 3);
        let config = ImportConfig {
            split_limit: 1000,
            create_octree_lod: false,
            max_degree_of_parallelism: 2,
            ..Default::default()
        };
        let set = import_chunks(
            &storage,
            vec![Chunk::new(pos_a.clone()), Chunk::new(pos_b.clone())],
            &config,
        )
        .unwrap();
        assert_eq!(set.point_count().unwrap(), 84_000);

        let mut expected = pos_a;
        expected.extend(pos_b);
        let collected = set.enumerate_points().unwrap();
        assert_same_point_multiset(&collected, &expected, 1e-5);
    }

    #[test]
    fn persist_and_reload_by_key() {
        let storage = storage();
        let chunk = Chunk::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(2.0, 2.0, 2.0),
        ]);
        let config = ImportConfig {
            key: Some("test".to_string()),
            split_limit: 10,
            ..Default::default()
        };
        let created = import_chunks(&storage, vec![chunk], &config).unwrap();

        let reopened = PointSet::open(&storage, "test").unwrap().unwrap();
        assert_eq!(reopened.id(), created.id());
        assert_eq!(reopened.root_node_id(), created.root_node_id());
        assert_eq!(reopened.point_count().unwrap(), 3);
        assert_eq!(
            sorted_bits(&reopened.enumerate_points().unwrap()),
            sorted_bits(&created.enumerate_points().unwrap())
        );
    }

    #[test]
    fn many_chunks_reduce_to_one_tree() {
        let storage = storage();
        let mut chunks = Vec::new();
        let mut expected = Vec::new();
        for i in 0..7 {
            let positions = random_positions(300, i as f64 * 0.4, 10 + i);
            expected.extend(positions.clone());
            chunks.push(Chunk::new(positions));
        }
        let config = ImportConfig {
            split_limit: 128,
            max_degree_of_parallelism: 4,
            ..Default::default()
        };
        let set = import_chunks(&storage, chunks, &config).unwrap();
        assert_eq!(set.point_count().unwrap(), 2100);
        assert_same_point_multiset(&set.enumerate_points().unwrap(), &expected, 1e-5);
        // lod ran by default: the root carries a bounded sample
        let root = set.root().unwrap();
        let points = root.as_points().unwrap();
        if !points.is_leaf() {
            let sample = points.lod_positions().unwrap().unwrap();
            assert!(!sample.is_empty());
            assert!(sample.len() <= 128);
        }
    }

    #[test]
    fn duplicate_chunks_counted_once() {
        let storage = storage();
        let positions = random_positions(50, 0.0, 20);
        let config = ImportConfig {
            split_limit: 100,
            deduplicate_chunks: true,
            ..Default::default()
        };
        let set = import_chunks(
            &storage,
            vec![
                Chunk::new(positions.clone()),
                Chunk::new(positions.clone()),
                Chunk::new(positions),
            ],
            &config,
        )
        .unwrap();
        assert_eq!(set.point_count().unwrap(), 50);
    }

    #[test]
    fn progress_is_monotone_and_complete() {
        let storage = storage();
        let reports: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&reports);
        let config = ImportConfig {
            split_limit: 64,
            max_degree_of_parallelism: 3,
            progress: Some(Arc::new(move |value| {
                sink.lock().unwrap().push(value);
            })),
            ..Default::default()
        };
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| Chunk::new(random_positions(200, i as f64, 30 + i as u64)))
            .collect();
        import_chunks(&storage, chunks, &config).unwrap();

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*reports.last().unwrap(), 1.0);
        assert!(reports.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn empty_import_persists_an_empty_tree() {
        let storage = storage();
        let config = ImportConfig {
            key: Some("empty".to_string()),
            ..Default::default()
        };
        let set = import_chunks(&storage, vec![], &config).unwrap();
        assert_eq!(set.point_count().unwrap(), 0);
        assert!(PointSet::open(&storage, "empty").unwrap().is_some());
    }

    #[test]
    fn cancellation_stops_the_import() {
        let storage = storage();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = ImportConfig {
            cancel,
            ..Default::default()
        };
        let result = import_chunks(
            &storage,
            vec![Chunk::new(random_positions(100, 0.0, 40))],
            &config,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let storage = storage();
        let config = ImportConfig {
            split_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            import_chunks(&storage, vec![], &config),
            Err(Error::InvalidInput(_))
        ));
    }
}
