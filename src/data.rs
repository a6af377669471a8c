//! Rating observations and the user-by-item rating table built from them.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{ItemId, Score, UserId};

/// Errors raised while building a [`RatingMatrix`].
#[derive(Debug, Fail, PartialEq)]
pub enum DataError {
    /// No entries were supplied.
    #[fail(display = "Cannot build a rating matrix from zero entries.")]
    NoEntries,
    /// The same (user, item) pair was given two different scores.
    #[fail(
        display = "Conflicting duplicate rating for user {} and item {}: {:?} vs {:?}.",
        user_id, item_id, first, second
    )]
    DuplicateEntry {
        /// User of the conflicting pair.
        user_id: UserId,
        /// Item of the conflicting pair.
        item_id: ItemId,
        /// Score seen first.
        first: Option<Score>,
        /// Score seen second.
        second: Option<Score>,
    },
    /// A present score was NaN or infinite.
    #[fail(display = "Non-finite score for user {} and item {}.", user_id, item_id)]
    NonFiniteScore {
        /// User of the offending entry.
        user_id: UserId,
        /// Item of the offending entry.
        item_id: ItemId,
    },
}

/// A single (user, item, score) observation. A score of `None` marks
/// an explicitly unrated pair.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RatingEntry {
    user_id: UserId,
    item_id: ItemId,
    score: Option<Score>,
}

impl RatingEntry {
    /// Build a rated entry.
    pub fn new<U: Into<UserId>, I: Into<ItemId>>(user_id: U, item_id: I, score: Score) -> Self {
        RatingEntry {
            user_id: user_id.into(),
            item_id: item_id.into(),
            score: Some(score),
        }
    }

    /// Build an entry marking the pair as unrated.
    pub fn unrated<U: Into<UserId>, I: Into<ItemId>>(user_id: U, item_id: I) -> Self {
        RatingEntry {
            user_id: user_id.into(),
            item_id: item_id.into(),
            score: None,
        }
    }

    /// The user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    /// The item id.
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
    /// The score, if present.
    pub fn score(&self) -> Option<Score> {
        self.score
    }
}

/// Dense user-by-item table of optional scores.
///
/// Users and items are indexed in ascending id order. Cells are stored
/// row-major; a cell is `None` whenever the pair was never rated or was
/// explicitly marked as unrated.
#[derive(Clone, Debug, PartialEq)]
pub struct RatingMatrix {
    users: Vec<UserId>,
    items: Vec<ItemId>,
    user_index: HashMap<UserId, usize>,
    item_index: HashMap<ItemId, usize>,
    scores: Vec<Option<Score>>,
}

impl RatingMatrix {
    /// Build the matrix from an ordered sequence of entries.
    ///
    /// Repeating a pair with the same score is accepted; repeating it
    /// with a different score (or a score and an unrated marker) fails
    /// with [`DataError::DuplicateEntry`].
    pub fn from_entries<T>(entries: T) -> Result<Self, DataError>
    where
        T: IntoIterator<Item = RatingEntry>,
    {
        let mut observed: BTreeMap<(UserId, ItemId), Option<Score>> = BTreeMap::new();
        let mut users = BTreeSet::new();
        let mut items = BTreeSet::new();

        for entry in entries {
            if let Some(score) = entry.score {
                if !score.is_finite() {
                    return Err(DataError::NonFiniteScore {
                        user_id: entry.user_id,
                        item_id: entry.item_id,
                    });
                }
            }

            users.insert(entry.user_id.clone());
            items.insert(entry.item_id.clone());

            let key = (entry.user_id, entry.item_id);

            match observed.get(&key) {
                Some(&previous) if previous != entry.score => {
                    return Err(DataError::DuplicateEntry {
                        user_id: key.0,
                        item_id: key.1,
                        first: previous,
                        second: entry.score,
                    });
                }
                Some(_) => {}
                None => {
                    observed.insert(key, entry.score);
                }
            }
        }

        if observed.is_empty() {
            return Err(DataError::NoEntries);
        }

        let users: Vec<UserId> = users.into_iter().collect();
        let items: Vec<ItemId> = items.into_iter().collect();
        let user_index: HashMap<UserId, usize> = users
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        let item_index: HashMap<ItemId, usize> = items
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();

        let mut scores = vec![None; users.len() * items.len()];

        for ((user_id, item_id), score) in observed {
            let row = user_index[&user_id];
            let col = item_index[&item_id];
            scores[row * items.len() + col] = score;
        }

        Ok(RatingMatrix {
            users,
            items,
            user_index,
            item_index,
            scores,
        })
    }

    /// Score of `user_id` for `item_id`; `None` if unrated or unknown.
    pub fn get(&self, user_id: &str, item_id: &str) -> Option<Score> {
        let row = self.user_position(user_id)?;
        let col = self.item_position(item_id)?;

        self.cell(row, col)
    }

    /// All cells of a user's row, keyed by item id.
    pub fn row(&self, user_id: &str) -> Option<BTreeMap<&str, Option<Score>>> {
        let row = self.user_position(user_id)?;

        Some(
            self.items
                .iter()
                .zip(self.row_slice(row))
                .map(|(item_id, &score)| (item_id.as_str(), score))
                .collect(),
        )
    }

    /// All cells of an item's column, keyed by user id.
    pub fn column(&self, item_id: &str) -> Option<BTreeMap<&str, Option<Score>>> {
        let col = self.item_position(item_id)?;

        Some(
            self.users
                .iter()
                .enumerate()
                .map(|(row, user_id)| (user_id.as_str(), self.cell(row, col)))
                .collect(),
        )
    }

    /// The observed ratings of a user, in item id order.
    pub fn rated_items(&self, user_id: &str) -> Option<Vec<(&str, Score)>> {
        let row = self.user_position(user_id)?;

        Some(
            self.items
                .iter()
                .zip(self.row_slice(row))
                .filter_map(|(item_id, score)| score.map(|score| (item_id.as_str(), score)))
                .collect(),
        )
    }

    /// Iterate over the rows of the matrix in user id order.
    pub fn iter_users(&self) -> RatingRowIterator {
        RatingRowIterator {
            matrix: self,
            idx: 0,
        }
    }

    /// User ids, ascending.
    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    /// Item ids, ascending.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    /// Row index of a user.
    pub fn user_position(&self, user_id: &str) -> Option<usize> {
        self.user_index.get(user_id).cloned()
    }

    /// Column index of an item.
    pub fn item_position(&self, item_id: &str) -> Option<usize> {
        self.item_index.get(item_id).cloned()
    }

    /// Number of observed (present) scores.
    pub fn num_observed(&self) -> usize {
        self.scores.iter().filter(|score| score.is_some()).count()
    }

    /// Number of users (rows).
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Number of items (columns).
    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users(), self.num_items())
    }

    pub(crate) fn cell(&self, row: usize, col: usize) -> Option<Score> {
        self.scores[row * self.items.len() + col]
    }

    pub(crate) fn row_slice(&self, row: usize) -> &[Option<Score>] {
        let start = row * self.items.len();
        let stop = start + self.items.len();

        &self.scores[start..stop]
    }
}

/// Iterator over the rows of a [`RatingMatrix`].
pub struct RatingRowIterator<'a> {
    matrix: &'a RatingMatrix,
    idx: usize,
}

/// A borrowed row of a [`RatingMatrix`].
#[derive(Debug)]
pub struct RatingRow<'a> {
    /// The user the row belongs to.
    pub user_id: &'a str,
    /// Cells in item id order.
    pub scores: &'a [Option<Score>],
}

impl<'a> RatingRow<'a> {
    /// Mean of the observed scores, `None` if the row has none.
    pub fn observed_mean(&self) -> Option<Score> {
        let (sum, count) = self
            .scores
            .iter()
            .filter_map(|&score| score)
            .fold((0.0, 0usize), |(sum, count), score| (sum + score, count + 1));

        if count == 0 {
            None
        } else {
            Some(sum / count as Score)
        }
    }
}

impl<'a> Iterator for RatingRowIterator<'a> {
    type Item = RatingRow<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.matrix.num_users() {
            None
        } else {
            Some(RatingRow {
                user_id: &self.matrix.users[self.idx],
                scores: self.matrix.row_slice(self.idx),
            })
        };

        self.idx += 1;

        value
    }
}
