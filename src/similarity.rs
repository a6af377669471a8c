//! Pairwise cosine similarity between users or items.
//!
//! The computation is split into one task per entity: task `e` scores `e`
//! against every other entity and returns its ranked neighbours. Tasks only
//! read the shared, immutable rating vectors, so they run on a bounded
//! rayon pool without any locking. Results are merged on the calling
//! thread once every task has returned; a task that fails is logged and
//! left out, and the rest of the batch is kept.
use std::any::Any;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use super::data::RatingMatrix;
use super::preprocessing::{ImputedMatrix, NormalizedMatrix};
use super::{ItemId, Score, UserId};

/// Default size of the similarity worker pool.
pub const DEFAULT_NUM_THREADS: usize = 6;

/// Which entities are compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Compare rows: users against users.
    User,
    /// Compare columns: items against items.
    Item,
}

/// Similarity error types.
#[derive(Debug, Fail, PartialEq)]
pub enum SimilarityError {
    /// The worker pool could not be started.
    #[fail(display = "Failed to build similarity worker pool: {}", reason)]
    WorkerPool {
        /// Reported cause.
        reason: String,
    },
    /// A worker pool of zero threads was requested.
    #[fail(display = "Invalid worker count {}: must be positive.", num_threads)]
    InvalidWorkerCount {
        /// Requested number of workers.
        num_threads: usize,
    },
    /// The entity vectors and ids do not line up.
    #[fail(display = "Got {} entity vectors for {} ids (entity index {}).", rows, ids, idx)]
    ShapeMismatch {
        /// Number of entity vectors.
        rows: usize,
        /// Number of entity ids.
        ids: usize,
        /// Requested entity index.
        idx: usize,
    },
    /// An entity's own vector contains NaN or infinite components.
    #[fail(display = "Vector of entity {} contains non-finite values.", entity)]
    NonFiniteValue {
        /// The entity whose task failed.
        entity: String,
    },
    /// A similarity came out as NaN or infinite.
    #[fail(display = "Non-finite similarity between {} and {}.", entity, neighbour)]
    NonFiniteSimilarity {
        /// The entity whose task failed.
        entity: String,
        /// The other side of the offending pair.
        neighbour: String,
    },
    /// The task panicked.
    #[fail(display = "Similarity task for {} panicked: {}", entity, reason)]
    TaskPanicked {
        /// The entity whose task failed.
        entity: String,
        /// Panic message, if one could be recovered.
        reason: String,
    },
}

/// A neighbour in a similarity ranking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbour {
    /// Id of the neighbouring entity.
    pub id: String,
    /// Cosine similarity, in `[-1, 1]`.
    pub similarity: Score,
}

/// A similarity task that did not produce a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Entity whose task failed.
    pub entity: String,
    /// Rendered error.
    pub reason: String,
}

/// Anything that can be viewed as a dense users-by-items table of
/// rating vectors.
pub trait RatingVectors: Sync {
    /// User ids, in row order.
    fn users(&self) -> &[UserId];
    /// Item ids, in column order.
    fn items(&self) -> &[ItemId];
    /// Dense users-by-items values.
    fn dense_values(&self) -> Cow<Array2<Score>>;
}

impl RatingVectors for NormalizedMatrix {
    fn users(&self) -> &[UserId] {
        NormalizedMatrix::users(self)
    }
    fn items(&self) -> &[ItemId] {
        NormalizedMatrix::items(self)
    }
    fn dense_values(&self) -> Cow<Array2<Score>> {
        Cow::Borrowed(self.values())
    }
}

impl RatingVectors for ImputedMatrix {
    fn users(&self) -> &[UserId] {
        ImputedMatrix::users(self)
    }
    fn items(&self) -> &[ItemId] {
        ImputedMatrix::items(self)
    }
    fn dense_values(&self) -> Cow<Array2<Score>> {
        Cow::Borrowed(self.values())
    }
}

/// Raw ratings, with absent cells read as zero.
impl RatingVectors for RatingMatrix {
    fn users(&self) -> &[UserId] {
        RatingMatrix::users(self)
    }
    fn items(&self) -> &[ItemId] {
        RatingMatrix::items(self)
    }
    fn dense_values(&self) -> Cow<Array2<Score>> {
        Cow::Owned(Array2::from_shape_fn(self.shape(), |(row, col)| {
            self.cell(row, col).unwrap_or(0.0)
        }))
    }
}

/// Cosine similarity of two vectors.
///
/// Zero if either vector has zero norm; finite results are clamped to
/// `[-1, 1]` to absorb rounding.
pub fn cosine(a: ArrayView1<Score>, b: ArrayView1<Score>) -> Score {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = a.dot(&b) / (norm_a * norm_b);

    if similarity.is_finite() {
        similarity.max(-1.0).min(1.0)
    } else {
        similarity
    }
}

fn cmp_neighbours(x: &Neighbour, y: &Neighbour) -> Ordering {
    y.similarity
        .partial_cmp(&x.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| x.id.cmp(&y.id))
}

/// Score entity `idx` (a row of `vectors`) against every other row.
///
/// Returns neighbours by descending similarity, ties broken by ascending
/// id; the entity itself is excluded. Fails with
/// [`SimilarityError::ShapeMismatch`] if `vectors` and `ids` differ in
/// length or `idx` is out of range.
pub fn rank_neighbours(
    vectors: ArrayView2<Score>,
    ids: &[String],
    idx: usize,
) -> Result<Vec<Neighbour>, SimilarityError> {
    if vectors.nrows() != ids.len() || idx >= ids.len() {
        return Err(SimilarityError::ShapeMismatch {
            rows: vectors.nrows(),
            ids: ids.len(),
            idx,
        });
    }

    let target = vectors.row(idx);

    if target.iter().any(|x| !x.is_finite()) {
        return Err(SimilarityError::NonFiniteValue {
            entity: ids[idx].clone(),
        });
    }

    let mut neighbours = Vec::with_capacity(ids.len().saturating_sub(1));

    for (other, id) in ids.iter().enumerate() {
        if other == idx {
            continue;
        }

        let similarity = cosine(target, vectors.row(other));

        if !similarity.is_finite() {
            return Err(SimilarityError::NonFiniteSimilarity {
                entity: ids[idx].clone(),
                neighbour: id.clone(),
            });
        }

        neighbours.push(Neighbour {
            id: id.clone(),
            similarity,
        });
    }

    neighbours.sort_by(cmp_neighbours);

    Ok(neighbours)
}

/// Symmetric similarity structure over the users or items of a matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatrix {
    axis: Axis,
    entities: Vec<String>,
    rankings: BTreeMap<String, Vec<Neighbour>>,
    failures: Vec<TaskFailure>,
}

impl SimilarityMatrix {
    /// Build a similarity matrix from precomputed rankings.
    ///
    /// Self-pairs are dropped and every ranking is re-sorted by descending
    /// similarity, ties by ascending id.
    pub fn from_rankings(axis: Axis, rankings: BTreeMap<String, Vec<Neighbour>>) -> Self {
        let rankings: BTreeMap<String, Vec<Neighbour>> = rankings
            .into_iter()
            .map(|(entity, ranking)| {
                let mut ranking: Vec<Neighbour> = ranking
                    .into_iter()
                    .filter(|neighbour| neighbour.id != entity)
                    .collect();
                ranking.sort_by(cmp_neighbours);
                (entity, ranking)
            })
            .collect();

        SimilarityMatrix {
            axis,
            entities: rankings.keys().cloned().collect(),
            rankings,
            failures: Vec::new(),
        }
    }

    /// The axis the similarities were computed along.
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Every entity that was submitted, including failed ones.
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    /// Ranked neighbours of `entity`, or `None` if its task failed or the
    /// entity is unknown.
    pub fn neighbours(&self, entity: &str) -> Option<&[Neighbour]> {
        self.rankings.get(entity).map(|ranking| ranking.as_slice())
    }

    /// The `k` most similar neighbours of `entity`.
    pub fn top_k(&self, entity: &str, k: usize) -> Option<&[Neighbour]> {
        self.neighbours(entity)
            .map(|ranking| &ranking[..k.min(ranking.len())])
    }

    /// Similarity between two distinct entities.
    ///
    /// Self-pairs always return `None`.
    pub fn get(&self, a: &str, b: &str) -> Option<Score> {
        if a == b {
            return None;
        }

        let lookup = |from: &str, to: &str| {
            self.neighbours(from).and_then(|ranking| {
                ranking
                    .iter()
                    .find(|neighbour| neighbour.id == to)
                    .map(|neighbour| neighbour.similarity)
            })
        };

        lookup(a, b).or_else(|| lookup(b, a))
    }

    /// Tasks that failed and were left out.
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Whether every submitted entity has a ranking.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of entities with a ranking.
    pub fn len(&self) -> usize {
        self.rankings.len()
    }

    /// Whether no entity has a ranking.
    pub fn is_empty(&self) -> bool {
        self.rankings.is_empty()
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Runs per-entity similarity tasks on a bounded worker pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityEngine {
    num_threads: usize,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        SimilarityEngine::new(DEFAULT_NUM_THREADS)
    }
}

impl SimilarityEngine {
    /// Build an engine with `num_threads` workers.
    pub fn new(num_threads: usize) -> Self {
        SimilarityEngine { num_threads }
    }

    /// Number of workers.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Compute cosine similarities between all users or all items of
    /// `matrix`.
    pub fn compute_all<M: RatingVectors>(
        &self,
        matrix: &M,
        axis: Axis,
    ) -> Result<SimilarityMatrix, SimilarityError> {
        self.compute_with(matrix, axis, rank_neighbours)
    }

    /// Run `task` once per entity and merge the results.
    ///
    /// `task` receives the entity vectors (one row per entity), the entity
    /// ids and the index of the entity to rank. Errors and panics inside a
    /// task are recorded as failures; the only errors returned are a
    /// worker count of zero and failure to build the pool.
    pub fn compute_with<M, F>(
        &self,
        matrix: &M,
        axis: Axis,
        task: F,
    ) -> Result<SimilarityMatrix, SimilarityError>
    where
        M: RatingVectors,
        F: Fn(ArrayView2<Score>, &[String], usize) -> Result<Vec<Neighbour>, SimilarityError>
            + Sync,
    {
        if self.num_threads == 0 {
            return Err(SimilarityError::InvalidWorkerCount {
                num_threads: self.num_threads,
            });
        }

        let values = matrix.dense_values();
        let (vectors, ids) = match axis {
            Axis::User => (values.view(), matrix.users()),
            Axis::Item => (values.t(), matrix.items()),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|error| SimilarityError::WorkerPool {
                reason: error.to_string(),
            })?;

        let outcomes: Vec<Result<Vec<Neighbour>, SimilarityError>> = pool.install(|| {
            (0..ids.len())
                .into_par_iter()
                .map(|idx| {
                    panic::catch_unwind(AssertUnwindSafe(|| task(vectors, ids, idx)))
                        .unwrap_or_else(|payload| {
                            Err(SimilarityError::TaskPanicked {
                                entity: ids[idx].clone(),
                                reason: panic_reason(payload.as_ref()),
                            })
                        })
                })
                .collect()
        });

        let mut rankings = BTreeMap::new();
        let mut failures = Vec::new();

        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(ranking) => {
                    rankings.insert(id.clone(), ranking);
                }
                Err(error) => {
                    warn!(entity = id.as_str(), error = %error, "similarity task failed, entity excluded");
                    failures.push(TaskFailure {
                        entity: id.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            axis = ?axis,
            entities = ids.len(),
            failed = failures.len(),
            workers = self.num_threads,
            "similarity matrix computed"
        );

        Ok(SimilarityMatrix {
            axis,
            entities: ids.to_owned(),
            rankings,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use ndarray::arr1;
    use rand::distributions::{Distribution, Uniform};
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::data::RatingEntry;
    use crate::datasets;
    use crate::preprocessing::{impute, normalize};

    fn normalized(entries: Vec<RatingEntry>) -> NormalizedMatrix {
        normalize(&impute(&RatingMatrix::from_entries(entries).unwrap()).unwrap())
    }

    fn random_matrix(seed: u64) -> Array2<Score> {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let range = Uniform::new(-3.0, 3.0);

        Array2::from_shape_fn((20, 7), |_| range.sample(&mut rng))
    }

    fn assert_symmetric_and_bounded(similarities: &SimilarityMatrix) {
        for a in similarities.entities() {
            for b in similarities.entities() {
                if a == b {
                    assert_eq!(similarities.get(a, b), None);
                } else {
                    let forward = similarities.get(a, b).unwrap();
                    let backward = similarities.get(b, a).unwrap();
                    assert!((forward - backward).abs() < 1e-12);
                    assert!(forward >= -1.0 && forward <= 1.0);
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cosine_edge_cases() {
        let a = arr1(&[1.0, 2.0, 3.0]);
        let zero = arr1(&[0.0, 0.0, 0.0]);

        assert!((cosine(a.view(), a.view()) - 1.0).abs() < 1e-12);
        assert_eq!(cosine(zero.view(), zero.view()), 0.0);
        assert_eq!(cosine(a.view(), zero.view()), 0.0);
        assert!((cosine(a.view(), (-&a).view()) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn similarities_are_symmetric_and_bounded() {
        let values = random_matrix(42);
        let ids: Vec<String> = (0..values.nrows()).map(|x| format!("user_{}", x)).collect();

        for idx in 0..ids.len() {
            let ranking = rank_neighbours(values.view(), &ids, idx).unwrap();

            assert_eq!(ranking.len(), ids.len() - 1);
            assert!(ranking.iter().all(|x| x.id != ids[idx]));

            for neighbour in &ranking {
                assert!(neighbour.similarity >= -1.0 && neighbour.similarity <= 1.0);
            }
            for pair in ranking.windows(2) {
                assert!(pair[0].similarity >= pair[1].similarity);
            }
        }

        let entries = datasets::synthetic(30, 10, 7);
        let ratings = RatingMatrix::from_entries(entries.clone()).unwrap();
        let normalized = normalized(entries);
        let engine = SimilarityEngine::new(3);

        for similarities in vec![
            engine.compute_all(&normalized, Axis::User).unwrap(),
            engine.compute_all(&normalized, Axis::Item).unwrap(),
            engine.compute_all(&ratings, Axis::User).unwrap(),
            engine.compute_all(&ratings, Axis::Item).unwrap(),
        ] {
            assert!(similarities.is_complete());
            assert_symmetric_and_bounded(&similarities);
        }
    }

    #[test]
    fn ties_are_broken_by_id() {
        let values = Array2::from_shape_vec(
            (3, 2),
            vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0],
        ).unwrap();
        let ids = vec!["c".to_owned(), "b".to_owned(), "a".to_owned()];

        let ranking = rank_neighbours(values.view(), &ids, 0).unwrap();
        let order: Vec<_> = ranking.iter().map(|x| x.id.as_str()).collect();

        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn item_axis_compares_columns() {
        let similarities = SimilarityEngine::new(2)
            .compute_all(
                &RatingMatrix::from_entries(datasets::movies()).unwrap(),
                Axis::Item,
            )
            .unwrap();

        assert_eq!(similarities.axis(), Axis::Item);
        assert_eq!(similarities.len(), 5);
        assert!(similarities.get("Avatar", "Titanic").unwrap() > 0.0);
        // Interestelar [0, 0, 5, 5, 4] and Titanic [4, 0, 5, 0, 0].
        let expected = 25.0 / (66.0_f64.sqrt() * 41.0_f64.sqrt());
        assert!((similarities.get("Interestelar", "Titanic").unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn result_does_not_depend_on_worker_count() {
        let normalized = normalized(datasets::synthetic(50, 12, 3));

        let single = SimilarityEngine::new(1)
            .compute_all(&normalized, Axis::User)
            .unwrap();
        let parallel = SimilarityEngine::new(4)
            .compute_all(&normalized, Axis::User)
            .unwrap();

        assert_eq!(single, parallel);
    }

    #[test]
    fn non_finite_vector_fails_only_its_task() {
        let mut values = random_matrix(1);
        values[(3, 2)] = ::std::f64::NAN;
        let ids: Vec<String> = (0..values.nrows()).map(|x| format!("user_{}", x)).collect();

        assert_eq!(
            rank_neighbours(values.view(), &ids, 3),
            Err(SimilarityError::NonFiniteValue {
                entity: "user_3".to_owned()
            })
        );
        match rank_neighbours(values.view(), &ids, 0) {
            Err(SimilarityError::NonFiniteSimilarity { neighbour, .. }) => {
                assert_eq!(neighbour, "user_3")
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn mismatched_vectors_and_ids_are_rejected() {
        let values = random_matrix(5);
        let ids: Vec<String> = (0..3).map(|x| format!("user_{}", x)).collect();

        assert_eq!(
            rank_neighbours(values.view(), &ids, 0),
            Err(SimilarityError::ShapeMismatch {
                rows: 20,
                ids: 3,
                idx: 0,
            })
        );

        let ids: Vec<String> = (0..values.nrows()).map(|x| format!("user_{}", x)).collect();
        assert_eq!(
            rank_neighbours(values.view(), &ids, 20),
            Err(SimilarityError::ShapeMismatch {
                rows: 20,
                ids: 20,
                idx: 20,
            })
        );
    }

    #[test]
    fn zero_workers_are_rejected() {
        let normalized = normalized(datasets::movies());

        assert_eq!(
            SimilarityEngine::new(0).compute_all(&normalized, Axis::User),
            Err(SimilarityError::InvalidWorkerCount { num_threads: 0 })
        );
    }

    #[test]
    fn failed_task_is_logged_and_excluded() {
        let normalized = normalized(datasets::movies());
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();

        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let similarities = tracing::subscriber::with_default(subscriber, || {
            SimilarityEngine::new(3)
                .compute_with(&normalized, Axis::User, |vectors, ids, idx| {
                    if ids[idx] == "Carla" {
                        Err(SimilarityError::NonFiniteValue {
                            entity: ids[idx].clone(),
                        })
                    } else {
                        rank_neighbours(vectors, ids, idx)
                    }
                })
                .unwrap()
        });

        assert!(similarities.neighbours("Carla").is_none());
        for user in &["Ana", "Bruno", "Daniel", "Eduarda"] {
            assert_eq!(similarities.neighbours(user).unwrap().len(), 4);
        }
        assert_eq!(similarities.failures().len(), 1);
        assert_eq!(similarities.failures()[0].entity, "Carla");

        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let failure_line = logs
            .lines()
            .find(|line| line.contains("similarity task failed"))
            .unwrap();
        assert!(failure_line.contains("WARN"));
        assert!(failure_line.contains("Carla"));
    }

    #[test]
    fn panicking_task_is_recovered() {
        let normalized = normalized(datasets::movies());

        let similarities = SimilarityEngine::new(2)
            .compute_with(&normalized, Axis::User, |vectors, ids, idx| {
                if ids[idx] == "Bruno" {
                    panic!("boom");
                }
                rank_neighbours(vectors, ids, idx)
            })
            .unwrap();

        assert_eq!(similarities.len(), 4);
        assert_eq!(
            similarities.failures(),
            &[TaskFailure {
                entity: "Bruno".to_owned(),
                reason: "Similarity task for Bruno panicked: boom".to_owned(),
            }]
        );
    }
}
