//! End-to-end fitting: ratings → imputation → normalisation →
//! similarities, and recommendation on top of the fitted model.
use super::data::{DataError, RatingEntry, RatingMatrix};
use super::preprocessing::{impute, normalize, ImputationError, ImputedMatrix, NormalizedMatrix};
use super::recommendation::{recommend, RecommendationError, Recommendations};
use super::similarity::{
    Axis, Neighbour, SimilarityEngine, SimilarityError, SimilarityMatrix, DEFAULT_NUM_THREADS,
};

/// Which representation of the ratings similarities are computed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorSource {
    /// Imputed and row-standardised ratings.
    Normalized,
    /// Imputed ratings.
    Imputed,
    /// Observed ratings with absent cells read as zero.
    Raw,
}

/// Pipeline error types.
#[derive(Debug, Fail)]
pub enum PipelineError {
    /// Invalid configuration value.
    #[fail(display = "Invalid value {} for {}: must be positive.", value, name)]
    InvalidConfig {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: usize,
    },
    /// The rating entries could not be assembled into a matrix.
    #[fail(display = "{}", _0)]
    Data(#[cause] DataError),
    /// Imputation failed.
    #[fail(display = "{}", _0)]
    Imputation(#[cause] ImputationError),
    /// The similarity computation could not run.
    #[fail(display = "{}", _0)]
    Similarity(#[cause] SimilarityError),
}

impl From<DataError> for PipelineError {
    fn from(error: DataError) -> Self {
        PipelineError::Data(error)
    }
}

impl From<ImputationError> for PipelineError {
    fn from(error: ImputationError) -> Self {
        PipelineError::Imputation(error)
    }
}

impl From<SimilarityError> for PipelineError {
    fn from(error: SimilarityError) -> Self {
        PipelineError::Similarity(error)
    }
}

/// Configuration of the recommendation pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    axis: Axis,
    source: VectorSource,
    top_k: usize,
    top_n: usize,
    num_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Build a configuration with default values: user-based similarity
    /// on normalised ratings, 5 neighbours, 5 recommendations and
    /// `DEFAULT_NUM_THREADS` workers.
    pub fn new() -> Self {
        Config {
            axis: Axis::User,
            source: VectorSource::Normalized,
            top_k: 5,
            top_n: 5,
            num_threads: DEFAULT_NUM_THREADS,
        }
    }

    /// Set the similarity axis.
    pub fn axis(mut self, axis: Axis) -> Self {
        self.axis = axis;
        self
    }

    /// Set the representation similarities are computed on.
    pub fn source(mut self, source: VectorSource) -> Self {
        self.source = source;
        self
    }

    /// Set the number of neighbours considered.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the number of recommendations returned.
    pub fn top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Set number of threads to be used.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Check that every size parameter is positive.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for &(name, value) in &[
            ("top_k", self.top_k),
            ("top_n", self.top_n),
            ("num_threads", self.num_threads),
        ] {
            if value == 0 {
                return Err(PipelineError::InvalidConfig { name, value });
            }
        }

        Ok(())
    }
}

/// Fits models according to a [`Config`].
#[derive(Clone, Debug)]
pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    /// Build a pipeline.
    pub fn new(config: Config) -> Self {
        Pipeline { config }
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every stage on `entries`.
    ///
    /// Duplicate entries and a matrix without any observed score are
    /// reported before any similarity is computed.
    pub fn fit<T>(&self, entries: T) -> Result<Model, PipelineError>
    where
        T: IntoIterator<Item = RatingEntry>,
    {
        self.config.validate()?;

        let ratings = RatingMatrix::from_entries(entries)?;
        let imputed = impute(&ratings)?;
        let normalized = normalize(&imputed);

        debug!(
            users = ratings.num_users(),
            items = ratings.num_items(),
            observed = ratings.num_observed(),
            "prepared rating matrices"
        );

        let engine = SimilarityEngine::new(self.config.num_threads);
        let similarities = match self.config.source {
            VectorSource::Normalized => engine.compute_all(&normalized, self.config.axis)?,
            VectorSource::Imputed => engine.compute_all(&imputed, self.config.axis)?,
            VectorSource::Raw => engine.compute_all(&ratings, self.config.axis)?,
        };

        Ok(Model {
            config: self.config.clone(),
            ratings,
            imputed,
            normalized,
            similarities,
        })
    }
}

/// A fitted model: every intermediate snapshot plus the similarities.
#[derive(Clone, Debug)]
pub struct Model {
    config: Config,
    ratings: RatingMatrix,
    imputed: ImputedMatrix,
    normalized: NormalizedMatrix,
    similarities: SimilarityMatrix,
}

impl Model {
    /// Recommend up to `top_n` unrated items for `user_id`.
    pub fn recommend(&self, user_id: &str) -> Result<Recommendations, RecommendationError> {
        recommend(
            user_id,
            &self.similarities,
            &self.ratings,
            self.config.top_k,
            self.config.top_n,
        )
    }

    /// Ranked neighbours of a user or item (depending on the axis).
    pub fn similar(&self, entity: &str) -> Option<&[Neighbour]> {
        self.similarities.neighbours(entity)
    }

    /// The configuration the model was fitted with.
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// Observed ratings.
    pub fn ratings(&self) -> &RatingMatrix {
        &self.ratings
    }
    /// Imputed ratings.
    pub fn imputed(&self) -> &ImputedMatrix {
        &self.imputed
    }
    /// Row-standardised ratings.
    pub fn normalized(&self) -> &NormalizedMatrix {
        &self.normalized
    }
    /// The similarity matrix.
    pub fn similarities(&self) -> &SimilarityMatrix {
        &self.similarities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets;

    #[test]
    fn item_based_recommendations_for_ana() {
        let model = Pipeline::new(
            Config::new()
                .axis(Axis::Item)
                .source(VectorSource::Raw)
                .num_threads(2),
        ).fit(datasets::movies())
            .unwrap();

        assert!(model.similarities().get("Avatar", "Titanic").unwrap() > 0.0);

        let recommendations = model.recommend("Ana").unwrap();
        let list = recommendations.ranked().unwrap();

        assert_eq!(list.item_ids(), vec!["Interestelar", "Vingadores"]);
    }

    #[test]
    fn user_based_recommendations_skip_rated_items() {
        let model = Pipeline::new(Config::new().top_k(2).top_n(5).num_threads(2))
            .fit(datasets::movies())
            .unwrap();

        assert_eq!(model.similar("Ana").unwrap().len(), 4);

        let recommendations = model.recommend("Ana").unwrap();
        for recommendation in recommendations.ranked().unwrap() {
            assert!(!["Matrix", "Titanic", "Avatar"].contains(&recommendation.item_id.as_str()));
        }
    }

    #[test]
    fn repeated_runs_are_identical() {
        let fit = |num_threads| {
            Pipeline::new(Config::new().num_threads(num_threads))
                .fit(datasets::synthetic(120, 25, 42))
                .unwrap()
        };

        let first = fit(4);
        let second = fit(4);
        let single = fit(1);

        assert_eq!(first.similarities(), second.similarities());
        assert_eq!(first.similarities(), single.similarities());

        for user in first.ratings().users() {
            let expected = first.recommend(user).unwrap();
            assert_eq!(second.recommend(user).unwrap(), expected);
            assert_eq!(single.recommend(user).unwrap(), expected);
        }
    }

    #[test]
    fn structural_errors_are_fatal() {
        let pipeline = Pipeline::new(Config::new());

        match pipeline.fit(vec![
            RatingEntry::new("Ana", "Matrix", 5.0),
            RatingEntry::new("Ana", "Matrix", 1.0),
        ]) {
            Err(PipelineError::Data(DataError::DuplicateEntry { .. })) => {}
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }

        match pipeline.fit(vec![RatingEntry::unrated("Ana", "Matrix")]) {
            Err(PipelineError::Imputation(ImputationError::EmptyMatrix)) => {}
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        match Pipeline::new(Config::new().num_threads(0)).fit(datasets::movies()) {
            Err(PipelineError::InvalidConfig { name, value }) => {
                assert_eq!(name, "num_threads");
                assert_eq!(value, 0);
            }
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn config_from_json() {
        let config: Config =
            serde_json::from_str(r#"{"axis": "item", "top_k": 3, "num_threads": 2}"#).unwrap();

        assert_eq!(
            config,
            Config::new().axis(Axis::Item).top_k(3).num_threads(2)
        );

        let serialized = serde_json::to_string(&config).unwrap();
        assert!(serialized.contains(r#""source":"normalized""#));
    }
}
