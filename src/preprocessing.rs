//! Imputation and per-row standardisation of rating matrices.
//!
//! Both stages are pure functions: each takes a borrowed snapshot and
//! returns a new, fully dense one.
use ndarray::{Array2, ArrayView1, Axis};

use super::data::RatingMatrix;
use super::{ItemId, Score, UserId};

/// Rows whose standard deviation falls below this are treated as constant.
pub const ZERO_VARIANCE_TOLERANCE: Score = 1e-12;

/// Imputation error types.
#[derive(Debug, Fail, PartialEq)]
pub enum ImputationError {
    /// No score is observed anywhere, so the global mean is undefined.
    #[fail(display = "Cannot impute a matrix with no observed scores.")]
    EmptyMatrix,
}

/// Where the fill value of an imputed row came from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FillSource {
    /// Mean of the row's own observed scores.
    RowMean,
    /// Global mean over every observed score.
    GlobalMean,
}

/// Statistics of a single dense row.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowStats {
    /// Row mean.
    pub mean: Score,
    /// Population standard deviation of the row.
    pub std_dev: Score,
}

impl RowStats {
    fn of(row: ArrayView1<Score>) -> Self {
        let count = row.len() as Score;
        let mean = row.sum() / count;
        let variance = row.iter().map(|x| (x - mean).powi(2)).sum::<Score>() / count;

        RowStats {
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// Whether the row is constant for normalisation purposes.
    pub fn is_degenerate(&self) -> bool {
        !(self.std_dev > ZERO_VARIANCE_TOLERANCE)
    }
}

/// Fully dense rating matrix with absent cells filled in.
#[derive(Clone, Debug)]
pub struct ImputedMatrix {
    users: Vec<UserId>,
    items: Vec<ItemId>,
    values: Array2<Score>,
    fill_values: Vec<Score>,
    fill_sources: Vec<FillSource>,
    global_mean: Score,
}

impl ImputedMatrix {
    /// Dense values, users by items.
    pub fn values(&self) -> &Array2<Score> {
        &self.values
    }
    /// The value absent cells of each row were filled with.
    pub fn fill_values(&self) -> &[Score] {
        &self.fill_values
    }
    /// Which fallback produced each row's fill value.
    pub fn fill_sources(&self) -> &[FillSource] {
        &self.fill_sources
    }
    /// Mean over all observed scores of the source matrix.
    pub fn global_mean(&self) -> Score {
        self.global_mean
    }
    /// User ids, ascending.
    pub fn users(&self) -> &[UserId] {
        &self.users
    }
    /// Item ids, ascending.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }
}

/// Dense matrix whose rows have zero mean and unit variance (or are all
/// zero, for constant rows).
#[derive(Clone, Debug)]
pub struct NormalizedMatrix {
    users: Vec<UserId>,
    items: Vec<ItemId>,
    values: Array2<Score>,
    row_stats: Vec<RowStats>,
}

impl NormalizedMatrix {
    /// Standardised values, users by items.
    pub fn values(&self) -> &Array2<Score> {
        &self.values
    }
    /// Mean and standard deviation each row was standardised with.
    pub fn row_stats(&self) -> &[RowStats] {
        &self.row_stats
    }
    /// User ids, ascending.
    pub fn users(&self) -> &[UserId] {
        &self.users
    }
    /// Item ids, ascending.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }
}

/// Fill every absent cell with its row's observed mean, falling back to
/// the global mean for rows with no observations.
pub fn impute(ratings: &RatingMatrix) -> Result<ImputedMatrix, ImputationError> {
    let (global_sum, global_count) = ratings
        .iter_users()
        .flat_map(|row| row.scores.iter().filter_map(|&score| score))
        .fold((0.0, 0usize), |(sum, count), score| (sum + score, count + 1));

    if global_count == 0 {
        return Err(ImputationError::EmptyMatrix);
    }

    let global_mean = global_sum / global_count as Score;

    let mut fill_values = Vec::with_capacity(ratings.num_users());
    let mut fill_sources = Vec::with_capacity(ratings.num_users());

    for row in ratings.iter_users() {
        let (fill, source) = match row.observed_mean() {
            Some(mean) => (mean, FillSource::RowMean),
            None => {
                debug!(user = row.user_id, global_mean, "no observed scores, using global mean");
                (global_mean, FillSource::GlobalMean)
            }
        };

        fill_values.push(fill);
        fill_sources.push(source);
    }

    let values = Array2::from_shape_fn(ratings.shape(), |(row, col)| {
        ratings.cell(row, col).unwrap_or(fill_values[row])
    });

    debug!(
        users = ratings.num_users(),
        items = ratings.num_items(),
        observed = global_count,
        "imputed rating matrix"
    );

    Ok(ImputedMatrix {
        users: ratings.users().to_owned(),
        items: ratings.items().to_owned(),
        values,
        fill_values,
        fill_sources,
        global_mean,
    })
}

/// Marker for a row that cannot be scaled to unit variance.
#[derive(Debug)]
struct DegenerateRow;

fn standardize_row(row: ArrayView1<Score>, stats: &RowStats) -> Result<Vec<Score>, DegenerateRow> {
    if stats.is_degenerate() {
        return Err(DegenerateRow);
    }

    Ok(row.iter().map(|x| (x - stats.mean) / stats.std_dev).collect())
}

/// Standardise each row to zero mean and unit population variance.
///
/// Constant rows are mapped to all zeros.
pub fn normalize(imputed: &ImputedMatrix) -> NormalizedMatrix {
    let mut values = Array2::zeros(imputed.values.dim());
    let mut row_stats = Vec::with_capacity(imputed.users.len());

    for (user_id, row, mut output) in izip!(
        &imputed.users,
        imputed.values.axis_iter(Axis(0)),
        values.axis_iter_mut(Axis(0))
    ) {
        let stats = RowStats::of(row);

        match standardize_row(row, &stats) {
            Ok(standardized) => {
                for (cell, value) in output.iter_mut().zip(standardized) {
                    *cell = value;
                }
            }
            Err(DegenerateRow) => {
                debug!(user = user_id.as_str(), "zero-variance row standardised to zeros");
            }
        }

        row_stats.push(stats);
    }

    NormalizedMatrix {
        users: imputed.users.clone(),
        items: imputed.items.clone(),
        values,
        row_stats,
    }
}
