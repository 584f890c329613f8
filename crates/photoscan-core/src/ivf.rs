//! Inverted-file layout: spherical k-means clusters over the stored vectors.

use serde::{Deserialize, Serialize};

/// Cluster centroids plus, per cluster, the positions of its member vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IvfLayout {
    pub centroids: Vec<Vec<f32>>,
    pub lists: Vec<Vec<usize>>,
    /// Number of vectors the centroids were trained on.
    pub trained_on: usize,
}

impl IvfLayout {
    /// Train `nlist` clusters with Lloyd iterations.
    ///
    /// Deterministic: centroids start at evenly spaced vectors and ties resolve
    /// to the lowest cluster index. Returns `None` for an empty input.
    pub fn train<F>(vectors: &[&[f32]], nlist: usize, iterations: usize, score: F) -> Option<Self>
    where
        F: Fn(&[f32], &[f32]) -> f32,
    {
        let n = vectors.len();
        let k = nlist.min(n);
        if k == 0 {
            return None;
        }
        let dim = vectors[0].len();

        let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * n / k].to_vec()).collect();
        let mut assignment = vec![usize::MAX; n];

        for _ in 0..iterations.max(1) {
            let mut changed = false;
            for (slot, v) in assignment.iter_mut().zip(vectors.iter()) {
                let best = nearest(&centroids, v, &score);
                if *slot != best {
                    *slot = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; k];
            let mut counts = vec![0usize; k];
            for (&c, v) in assignment.iter().zip(vectors.iter()) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += x;
                }
            }
            for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
                // Empty clusters keep their previous centroid.
                if count > 0 {
                    let norm = sum.iter().map(|x| x * x).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        *centroid = sum.into_iter().map(|x| x / norm).collect();
                    }
                }
            }
        }

        let mut lists = vec![Vec::new(); k];
        for (pos, v) in vectors.iter().enumerate() {
            lists[nearest(&centroids, v, &score)].push(pos);
        }

        Some(Self {
            centroids,
            lists,
            trained_on: n,
        })
    }

    /// Append the vector stored at `pos` to its nearest cluster.
    pub fn assign<F>(&mut self, pos: usize, vector: &[f32], score: F)
    where
        F: Fn(&[f32], &[f32]) -> f32,
    {
        let best = nearest(&self.centroids, vector, &score);
        self.lists[best].push(pos);
    }

    /// Positions in the `nprobe` clusters closest to `query`, ascending.
    pub fn probe<F>(&self, query: &[f32], nprobe: usize, score: F) -> Vec<usize>
    where
        F: Fn(&[f32], &[f32]) -> f32,
    {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score(query, c)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut positions: Vec<usize> = ranked
            .iter()
            .take(nprobe.max(1))
            .flat_map(|&(i, _)| self.lists[i].iter().copied())
            .collect();
        positions.sort_unstable();
        positions
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }
}

fn nearest<F>(centroids: &[Vec<f32>], v: &[f32], score: &F) -> usize
where
    F: Fn(&[f32], &[f32]) -> f32,
{
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = score(v, c);
        if s > best_score {
            best_score = s;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::dot;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    #[test]
    fn test_train_separates_two_groups() {
        let data: Vec<Vec<f32>> = [0.0, 0.05, 0.1, 3.0, 3.05, 3.1].iter().map(|&a| unit(a)).collect();
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();

        let layout = IvfLayout::train(&refs, 2, 10, dot).unwrap();
        assert_eq!(layout.nlist(), 2);
        let mut lists = layout.lists.clone();
        lists.sort();
        assert_eq!(lists, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_probe_returns_nearest_cluster_members() {
        let data: Vec<Vec<f32>> = [0.0, 0.05, 3.0, 3.05].iter().map(|&a| unit(a)).collect();
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let layout = IvfLayout::train(&refs, 2, 10, dot).unwrap();

        assert_eq!(layout.probe(&unit(3.02), 1, dot), vec![2, 3]);
        assert_eq!(layout.probe(&unit(3.02), 2, dot), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_train_caps_clusters_at_vector_count() {
        let data = [unit(0.0), unit(1.0)];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let layout = IvfLayout::train(&refs, 100, 5, dot).unwrap();
        assert_eq!(layout.nlist(), 2);
        assert!(IvfLayout::train(&[], 4, 5, dot).is_none());
    }

    #[test]
    fn test_assign_appends_to_nearest() {
        let data = [unit(0.0), unit(3.0)];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let mut layout = IvfLayout::train(&refs, 2, 5, dot).unwrap();
        layout.assign(2, &unit(2.9), dot);
        let cluster = layout.lists.iter().position(|l| l.contains(&1)).unwrap();
        assert!(layout.lists[cluster].contains(&2));
    }
}
