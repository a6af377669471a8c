//! Turning a similarity neighbourhood into ranked recommendations.
//!
//! With user similarities, an unrated item scores the mean rating given
//! to it by the target's `top_k` most similar users. With item
//! similarities, the candidates are the `top_k` neighbours of each item
//! the target rated, and a candidate `i` scores `sum_j sim(i, j) * r(target, j)`
//! over every item `j` the target rated.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::slice;

use super::data::RatingMatrix;
use super::similarity::{Axis, SimilarityMatrix};
use super::{ItemId, Score};

/// Recommendation error types.
#[derive(Debug, Fail, PartialEq)]
pub enum RecommendationError {
    /// The target user does not appear in the rating matrix.
    #[fail(display = "Unknown target user {}.", target)]
    UnknownTarget {
        /// The requested user.
        target: String,
    },
    /// The target has no similarity ranking (its task failed).
    #[fail(display = "No similarities available for {}.", target)]
    MissingSimilarities {
        /// The requested user.
        target: String,
    },
    /// A neighbourhood or list size of zero was requested.
    #[fail(display = "Invalid value {} for {}: must be positive.", value, name)]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: usize,
    },
}

/// A recommended item and its aggregated score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// The recommended item.
    pub item_id: ItemId,
    /// Aggregated neighbourhood score.
    pub score: Score,
}

/// Non-empty, ranked recommendations for one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationList {
    target: String,
    recommendations: Vec<Recommendation>,
}

impl RecommendationList {
    /// The user the list was built for.
    pub fn target(&self) -> &str {
        &self.target
    }
    /// Iterate in rank order.
    pub fn iter(&self) -> slice::Iter<Recommendation> {
        self.recommendations.iter()
    }
    /// Recommended item ids in rank order.
    pub fn item_ids(&self) -> Vec<&str> {
        self.iter().map(|x| x.item_id.as_str()).collect()
    }
    /// Number of recommendations.
    pub fn len(&self) -> usize {
        self.recommendations.len()
    }
    /// Whether the list is empty; `recommend` reports that case as [`Recommendations::Empty`] instead.
    pub fn is_empty(&self) -> bool {
        self.recommendations.is_empty()
    }
    /// The recommendations as a slice.
    pub fn as_slice(&self) -> &[Recommendation] {
        &self.recommendations
    }
}

impl<'a> IntoIterator for &'a RecommendationList {
    type Item = &'a Recommendation;
    type IntoIter = slice::Iter<'a, Recommendation>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Outcome of a recommendation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Recommendations {
    /// At least one eligible item was found.
    Ranked(RecommendationList),
    /// No eligible candidate: every reachable item is already rated, or
    /// the neighbourhood rated nothing new.
    Empty,
}

impl Recommendations {
    /// The ranked list, if any.
    pub fn ranked(&self) -> Option<&RecommendationList> {
        match self {
            Recommendations::Ranked(list) => Some(list),
            Recommendations::Empty => None,
        }
    }

    /// Whether this is the empty-result sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Recommendations::Empty
    }
}

fn cmp_recommendations(x: &Recommendation, y: &Recommendation) -> Ordering {
    y.score
        .partial_cmp(&x.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| x.item_id.cmp(&y.item_id))
}

fn check_positive(name: &'static str, value: usize) -> Result<(), RecommendationError> {
    if value == 0 {
        Err(RecommendationError::InvalidParameter { name, value })
    } else {
        Ok(())
    }
}

/// Recommend up to `top_n` unrated items for `target`.
///
/// User-based or item-based aggregation is chosen by the axis of
/// `similarities`.
pub fn recommend(
    target: &str,
    similarities: &SimilarityMatrix,
    ratings: &RatingMatrix,
    top_k: usize,
    top_n: usize,
) -> Result<Recommendations, RecommendationError> {
    check_positive("top_k", top_k)?;
    check_positive("top_n", top_n)?;

    let rated = ratings
        .rated_items(target)
        .ok_or_else(|| RecommendationError::UnknownTarget {
            target: target.to_owned(),
        })?;

    let candidates = match similarities.axis() {
        Axis::User => user_based_scores(target, similarities, ratings, top_k)?,
        Axis::Item => item_based_scores(&rated, similarities, top_k),
    };

    let mut recommendations: Vec<Recommendation> = candidates
        .into_iter()
        .filter(|&(item_id, _)| ratings.get(target, item_id).is_none())
        .map(|(item_id, score)| Recommendation {
            item_id: item_id.to_owned(),
            score,
        })
        .collect();

    if recommendations.is_empty() {
        debug!(user = target, "no eligible recommendation candidates");
        return Ok(Recommendations::Empty);
    }

    recommendations.sort_by(cmp_recommendations);
    recommendations.truncate(top_n);

    Ok(Recommendations::Ranked(RecommendationList {
        target: target.to_owned(),
        recommendations,
    }))
}

/// Mean rating of each item over the neighbours who rated it.
fn user_based_scores<'a>(
    target: &str,
    similarities: &SimilarityMatrix,
    ratings: &'a RatingMatrix,
    top_k: usize,
) -> Result<BTreeMap<&'a str, Score>, RecommendationError> {
    let neighbours = similarities.top_k(target, top_k).ok_or_else(|| {
        RecommendationError::MissingSimilarities {
            target: target.to_owned(),
        }
    })?;

    let mut sums: BTreeMap<&'a str, (Score, usize)> = BTreeMap::new();

    for neighbour in neighbours {
        let neighbour_ratings = match ratings.rated_items(&neighbour.id) {
            Some(neighbour_ratings) => neighbour_ratings,
            None => continue,
        };

        for (item_id, score) in neighbour_ratings {
            let entry = sums.entry(item_id).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }

    Ok(sums
        .into_iter()
        .map(|(item_id, (sum, count))| (item_id, sum / count as Score))
        .collect())
}

/// Similarity-weighted sum of the target's own ratings.
fn item_based_scores<'a>(
    rated: &[(&str, Score)],
    similarities: &'a SimilarityMatrix,
    top_k: usize,
) -> BTreeMap<&'a str, Score> {
    let mut candidates = BTreeSet::new();

    for &(item_id, _) in rated {
        match similarities.top_k(item_id, top_k) {
            Some(neighbours) => {
                candidates.extend(neighbours.iter().map(|neighbour| neighbour.id.as_str()))
            }
            None => warn!(
                item = item_id,
                "no similarities for rated item, no candidates drawn from it"
            ),
        }
    }

    candidates
        .into_iter()
        .map(|candidate| {
            let score: Score = rated
                .iter()
                .filter_map(|&(item_id, rating)| {
                    similarities
                        .get(candidate, item_id)
                        .map(|similarity| similarity * rating)
                })
                .sum();

            (candidate, score)
        })
        .collect()
}
