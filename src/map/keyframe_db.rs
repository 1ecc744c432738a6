//! KeyframeDatabase - inverted index for place recognition.
//!
//! Maps every vocabulary word to the keyframes containing it, so that
//! relocalization only scores keyframes sharing words with the query.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::vocabulary::{BowVector, Vocabulary};

use super::keyframe::Keyframe;
use super::types::KeyframeId;

/// Covisible neighbors accumulated into a candidate's group score.
const GROUP_NEIGHBORS: usize = 10;

#[derive(Debug, Default)]
pub struct KeyframeDatabase {
    inverted_index: HashMap<u32, Vec<KeyframeId>>,
}

impl KeyframeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kf_id: KeyframeId, bow: &BowVector) {
        for word in bow.keys() {
            self.inverted_index.entry(*word).or_default().push(kf_id);
        }
    }

    pub fn erase(&mut self, kf_id: KeyframeId, bow: &BowVector) {
        for word in bow.keys() {
            if let Some(list) = self.inverted_index.get_mut(word) {
                list.retain(|&id| id != kf_id);
                if list.is_empty() {
                    self.inverted_index.remove(word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted_index.clear();
    }

    /// Keyframes similar to `query`.
    ///
    /// Keyframes sharing at least 80% of the best shared-word count are
    /// scored. Each one is then credited with the scores of its best
    /// covisible neighbors that also qualified, and the best keyframe of
    /// every group scoring above `score_ratio` of the best group is returned,
    /// best first.
    pub fn relocalization_candidates(
        &self,
        query: &BowVector,
        keyframes: &BTreeMap<KeyframeId, Keyframe>,
        score_ratio: f64,
    ) -> Vec<KeyframeId> {
        let mut shared_words: HashMap<KeyframeId, usize> = HashMap::new();
        for word in query.keys() {
            if let Some(list) = self.inverted_index.get(word) {
                for &kf_id in list {
                    *shared_words.entry(kf_id).or_insert(0) += 1;
                }
            }
        }
        let Some(&max_common) = shared_words.values().max() else {
            return Vec::new();
        };
        let min_common = (0.8 * max_common as f64) as usize;

        let scores: HashMap<KeyframeId, f64> = shared_words
            .iter()
            .filter(|&(_, &n)| n > min_common)
            .filter_map(|(&id, _)| {
                let kf = keyframes.get(&id).filter(|kf| !kf.is_bad)?;
                Some((id, Vocabulary::score(query, &kf.bow_vector)))
            })
            .collect();
        if scores.is_empty() {
            return Vec::new();
        }

        let mut groups: Vec<(f64, KeyframeId)> = Vec::with_capacity(scores.len());
        for (&id, &score) in &scores {
            let Some(kf) = keyframes.get(&id) else {
                continue;
            };
            let mut best_id = id;
            let mut best_score = score;
            let mut acc = score;
            for neighbor in kf.best_covisibles(GROUP_NEIGHBORS) {
                if let Some(&s) = scores.get(&neighbor) {
                    acc += s;
                    if s > best_score {
                        best_score = s;
                        best_id = neighbor;
                    }
                }
            }
            groups.push((acc, best_id));
        }

        let best_acc = groups.iter().map(|g| g.0).fold(0.0, f64::max);
        let min_acc = score_ratio * best_acc;
        groups.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut seen = HashSet::new();
        groups
            .into_iter()
            .filter(|&(acc, _)| acc > min_acc)
            .filter_map(|(_, id)| seen.insert(id).then_some(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;

    fn keyframe(id: u64, words: &[(u32, f64)]) -> Keyframe {
        let mut kf = Keyframe::new(KeyframeId::new(id), 0.0, SE3::identity(), vec![], vec![]);
        kf.bow_vector = words.iter().copied().collect();
        kf
    }

    #[test]
    fn test_candidates_prefer_shared_words() {
        let mut keyframes = BTreeMap::new();
        keyframes.insert(KeyframeId::new(0), keyframe(0, &[(1, 0.5), (2, 0.5)]));
        keyframes.insert(KeyframeId::new(1), keyframe(1, &[(3, 0.5), (4, 0.5)]));
        keyframes.insert(KeyframeId::new(2), keyframe(2, &[(1, 0.25), (5, 0.75)]));

        let mut db = KeyframeDatabase::new();
        for (id, kf) in &keyframes {
            db.add(*id, &kf.bow_vector);
        }

        let query: BowVector = [(1, 0.5), (2, 0.5)].into_iter().collect();
        let candidates = db.relocalization_candidates(&query, &keyframes, 0.75);
        assert_eq!(candidates, vec![KeyframeId::new(0)]);
    }

    #[test]
    fn test_erase_removes_from_index() {
        let kf = keyframe(0, &[(1, 1.0)]);
        let mut keyframes = BTreeMap::new();
        keyframes.insert(kf.id, kf.clone());

        let mut db = KeyframeDatabase::new();
        db.add(kf.id, &kf.bow_vector);
        db.erase(kf.id, &kf.bow_vector);

        let query: BowVector = [(1, 1.0)].into_iter().collect();
        assert!(db.relocalization_candidates(&query, &keyframes, 0.75).is_empty());
    }
}
