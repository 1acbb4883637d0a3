//! Maximum-weight matching on general (non-bipartite) graphs.
//!
//! Edmonds' blossom algorithm with dual variables, O(n³). Weights are integers so
//! the dual updates stay exact; callers scale their scores before handing edges in.
//! Labels: 0 = free, 1 = S, 2 = T; bit 4 marks a blossom during `scan_blossom`.

const NONE: usize = usize::MAX;

/// Computes a maximum-weight matching. With `max_cardinality` set, only
/// maximum-cardinality matchings are considered and the heaviest of those is
/// returned.
///
/// `edges` are `(u, v, weight)` with `u != v` and both below `vertex_count`.
/// Returns the mate of every vertex.
pub fn max_weight_matching(
    vertex_count: usize,
    edges: &[(usize, usize, i64)],
    max_cardinality: bool,
) -> Vec<Option<usize>> {
    if edges.is_empty() || vertex_count == 0 {
        return vec![None; vertex_count];
    }
    debug_assert!(edges.iter().all(|&(u, v, _)| u != v && u < vertex_count && v < vertex_count));

    let mut state = Blossom::new(vertex_count, edges);
    state.solve(max_cardinality);
    state
        .mate
        .iter()
        .map(|&p| if p == NONE { None } else { Some(state.endpoint[p]) })
        .collect()
}

struct Blossom<'a> {
    edges: &'a [(usize, usize, i64)],
    n: usize,
    /// `endpoint[p]` is the vertex at end `p`; edge `k` has ends `2k` and `2k + 1`.
    endpoint: Vec<usize>,
    /// Per vertex, the remote ends of its incident edges.
    neighbend: Vec<Vec<usize>>,
    /// Per vertex, the remote end of its matched edge.
    mate: Vec<usize>,
    label: Vec<u8>,
    label_end: Vec<usize>,
    in_blossom: Vec<usize>,
    blossom_parent: Vec<usize>,
    blossom_children: Vec<Vec<usize>>,
    blossom_base: Vec<usize>,
    blossom_endps: Vec<Vec<usize>>,
    best_edge: Vec<usize>,
    blossom_best_edges: Vec<Option<Vec<usize>>>,
    unused_blossoms: Vec<usize>,
    dual: Vec<i64>,
    allow_edge: Vec<bool>,
    queue: Vec<usize>,
}

impl<'a> Blossom<'a> {
    fn new(n: usize, edges: &'a [(usize, usize, i64)]) -> Self {
        let max_weight = edges.iter().map(|e| e.2).max().unwrap_or(0).max(0);
        let endpoint = (0..2 * edges.len())
            .map(|p| if p % 2 == 0 { edges[p / 2].0 } else { edges[p / 2].1 })
            .collect();
        let mut neighbend = vec![Vec::new(); n];
        for (k, &(i, j, _)) in edges.iter().enumerate() {
            neighbend[i].push(2 * k + 1);
            neighbend[j].push(2 * k);
        }
        let mut dual = vec![max_weight; n];
        dual.extend(std::iter::repeat(0).take(n));

        Blossom {
            edges,
            n,
            endpoint,
            neighbend,
            mate: vec![NONE; n],
            label: vec![0; 2 * n],
            label_end: vec![NONE; 2 * n],
            in_blossom: (0..n).collect(),
            blossom_parent: vec![NONE; 2 * n],
            blossom_children: vec![Vec::new(); 2 * n],
            blossom_base: (0..n).chain(std::iter::repeat(NONE).take(n)).collect(),
            blossom_endps: vec![Vec::new(); 2 * n],
            best_edge: vec![NONE; 2 * n],
            blossom_best_edges: vec![None; 2 * n],
            unused_blossoms: (n..2 * n).collect(),
            dual,
            allow_edge: vec![false; edges.len()],
            queue: Vec::new(),
        }
    }

    fn slack(&self, k: usize) -> i64 {
        let (i, j, w) = self.edges[k];
        self.dual[i] + self.dual[j] - 2 * w
    }

    fn blossom_leaves(&self, b: usize) -> Vec<usize> {
        let mut leaves = Vec::new();
        self.collect_leaves(b, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, b: usize, out: &mut Vec<usize>) {
        if b < self.n {
            out.push(b);
        } else {
            for &t in &self.blossom_children[b] {
                self.collect_leaves(t, out);
            }
        }
    }

    fn child_at(&self, b: usize, j: isize) -> usize {
        let children = &self.blossom_children[b];
        children[j.rem_euclid(children.len() as isize) as usize]
    }

    fn endp_at(&self, b: usize, j: isize) -> usize {
        let endps = &self.blossom_endps[b];
        endps[j.rem_euclid(endps.len() as isize) as usize]
    }

    fn assign_label(&mut self, w: usize, t: u8, p: usize) {
        let b = self.in_blossom[w];
        self.label[w] = t;
        self.label[b] = t;
        self.label_end[w] = p;
        self.label_end[b] = p;
        self.best_edge[w] = NONE;
        self.best_edge[b] = NONE;
        if t == 1 {
            let leaves = self.blossom_leaves(b);
            self.queue.extend(leaves);
        } else if t == 2 {
            let base = self.blossom_base[b];
            let mate = self.mate[base];
            self.assign_label(self.endpoint[mate], 1, mate ^ 1);
        }
    }

    /// Walks back from `v` and `w` to find either a new blossom's base or an
    /// augmenting path (returns `NONE`).
    fn scan_blossom(&mut self, mut v: usize, mut w: usize) -> usize {
        let mut path = Vec::new();
        let mut base = NONE;
        while v != NONE || w != NONE {
            let mut b = self.in_blossom[v];
            if self.label[b] & 4 != 0 {
                base = self.blossom_base[b];
                break;
            }
            path.push(b);
            self.label[b] = 5;
            if self.label_end[b] == NONE {
                v = NONE;
            } else {
                v = self.endpoint[self.label_end[b]];
                b = self.in_blossom[v];
                v = self.endpoint[self.label_end[b]];
            }
            if w != NONE {
                std::mem::swap(&mut v, &mut w);
            }
        }
        for b in path {
            self.label[b] = 1;
        }
        base
    }

    fn add_blossom(&mut self, base: usize, k: usize) {
        let (v, w, _) = self.edges[k];
        let bb = self.in_blossom[base];
        let mut bv = self.in_blossom[v];
        let mut bw = self.in_blossom[w];
        let b = self.unused_blossoms.pop().expect("at most n blossoms exist at once");
        self.blossom_base[b] = base;
        self.blossom_parent[b] = NONE;
        self.blossom_parent[bb] = b;

        let mut path = Vec::new();
        let mut endps = Vec::new();
        while bv != bb {
            self.blossom_parent[bv] = b;
            path.push(bv);
            endps.push(self.label_end[bv]);
            let next = self.endpoint[self.label_end[bv]];
            bv = self.in_blossom[next];
        }
        path.push(bb);
        path.reverse();
        endps.reverse();
        endps.push(2 * k);
        while bw != bb {
            self.blossom_parent[bw] = b;
            path.push(bw);
            endps.push(self.label_end[bw] ^ 1);
            let next = self.endpoint[self.label_end[bw]];
            bw = self.in_blossom[next];
        }

        self.blossom_children[b] = path.clone();
        self.blossom_endps[b] = endps;
        self.label[b] = 1;
        self.label_end[b] = self.label_end[bb];
        self.dual[b] = 0;
        for leaf in self.blossom_leaves(b) {
            if self.label[self.in_blossom[leaf]] == 2 {
                self.queue.push(leaf);
            }
            self.in_blossom[leaf] = b;
        }

        let mut best_edge_to = vec![NONE; 2 * self.n];
        for &child in &path {
            let lists: Vec<Vec<usize>> = match self.blossom_best_edges[child].take() {
                Some(list) => vec![list],
                None => self
                    .blossom_leaves(child)
                    .into_iter()
                    .map(|leaf| self.neighbend[leaf].iter().map(|p| p / 2).collect())
                    .collect(),
            };
            for k in lists.into_iter().flatten() {
                let (i, j, _) = self.edges[k];
                let j = if self.in_blossom[j] == b { i } else { j };
                let bj = self.in_blossom[j];
                if bj != b
                    && self.label[bj] == 1
                    && (best_edge_to[bj] == NONE || self.slack(k) < self.slack(best_edge_to[bj]))
                {
                    best_edge_to[bj] = k;
                }
            }
            self.best_edge[child] = NONE;
        }

        let best: Vec<usize> = best_edge_to.into_iter().filter(|&k| k != NONE).collect();
        self.best_edge[b] = NONE;
        for &k in &best {
            if self.best_edge[b] == NONE || self.slack(k) < self.slack(self.best_edge[b]) {
                self.best_edge[b] = k;
            }
        }
        self.blossom_best_edges[b] = Some(best);
    }

    fn expand_blossom(&mut self, b: usize, end_stage: bool) {
        let children = self.blossom_children[b].clone();
        for &s in &children {
            self.blossom_parent[s] = NONE;
            if s < self.n {
                self.in_blossom[s] = s;
            } else if end_stage && self.dual[s] == 0 {
                self.expand_blossom(s, end_stage);
            } else {
                for leaf in self.blossom_leaves(s) {
                    self.in_blossom[leaf] = s;
                }
            }
        }

        if !end_stage && self.label[b] == 2 {
            // Relabel the children along the even path from the entry child to the base.
            let entry_child = self.in_blossom[self.endpoint[self.label_end[b] ^ 1]];
            let len = children.len() as isize;
            let mut j = children
                .iter()
                .position(|&c| c == entry_child)
                .expect("entry child belongs to the blossom") as isize;
            let (j_step, endptrick): (isize, usize) = if j & 1 != 0 {
                j -= len;
                (1, 0)
            } else {
                (-1, 1)
            };
            let mut p = self.label_end[b];
            while j != 0 {
                self.label[self.endpoint[p ^ 1]] = 0;
                let q = self.endp_at(b, j - endptrick as isize);
                self.label[self.endpoint[q ^ endptrick ^ 1]] = 0;
                self.assign_label(self.endpoint[p ^ 1], 2, p);
                self.allow_edge[q / 2] = true;
                j += j_step;
                p = self.endp_at(b, j - endptrick as isize) ^ endptrick;
                self.allow_edge[p / 2] = true;
                j += j_step;
            }
            let bv = self.child_at(b, j);
            let entry = self.endpoint[p ^ 1];
            self.label[entry] = 2;
            self.label[bv] = 2;
            self.label_end[entry] = p;
            self.label_end[bv] = p;
            self.best_edge[bv] = NONE;
            j += j_step;
            while self.child_at(b, j) != entry_child {
                let bv = self.child_at(b, j);
                if self.label[bv] == 1 {
                    j += j_step;
                    continue;
                }
                let reached = self.blossom_leaves(bv).into_iter().find(|&leaf| self.label[leaf] != 0);
                if let Some(leaf) = reached {
                    self.label[leaf] = 0;
                    let mate_end = self.mate[self.blossom_base[bv]];
                    self.label[self.endpoint[mate_end]] = 0;
                    self.assign_label(leaf, 2, self.label_end[leaf]);
                }
                j += j_step;
            }
        }

        self.label[b] = 0;
        self.label_end[b] = NONE;
        self.blossom_children[b].clear();
        self.blossom_endps[b].clear();
        self.blossom_base[b] = NONE;
        self.blossom_best_edges[b] = None;
        self.best_edge[b] = NONE;
        self.unused_blossoms.push(b);
    }

    /// Swaps matched and unmatched edges along the even path from `v` to the
    /// base of blossom `b`, making `v` the new base.
    fn augment_blossom(&mut self, b: usize, v: usize) {
        let mut t = v;
        while self.blossom_parent[t] != b {
            t = self.blossom_parent[t];
        }
        if t >= self.n {
            self.augment_blossom(t, v);
        }
        let len = self.blossom_children[b].len() as isize;
        let i = self.blossom_children[b]
            .iter()
            .position(|&c| c == t)
            .expect("child belongs to the blossom");
        let mut j = i as isize;
        let (j_step, endptrick): (isize, usize) = if j & 1 != 0 {
            j -= len;
            (1, 0)
        } else {
            (-1, 1)
        };
        while j != 0 {
            j += j_step;
            let t = self.child_at(b, j);
            let p = self.endp_at(b, j - endptrick as isize) ^ endptrick;
            if t >= self.n {
                self.augment_blossom(t, self.endpoint[p]);
            }
            j += j_step;
            let t = self.child_at(b, j);
            if t >= self.n {
                self.augment_blossom(t, self.endpoint[p ^ 1]);
            }
            self.mate[self.endpoint[p]] = p ^ 1;
            self.mate[self.endpoint[p ^ 1]] = p;
        }
        self.blossom_children[b].rotate_left(i);
        self.blossom_endps[b].rotate_left(i);
        self.blossom_base[b] = self.blossom_base[self.blossom_children[b][0]];
    }

    fn augment_matching(&mut self, k: usize) {
        let (v, w, _) = self.edges[k];
        for (mut s, mut p) in [(v, 2 * k + 1), (w, 2 * k)] {
            loop {
                let bs = self.in_blossom[s];
                if bs >= self.n {
                    self.augment_blossom(bs, s);
                }
                self.mate[s] = p;
                if self.label_end[bs] == NONE {
                    break;
                }
                let t = self.endpoint[self.label_end[bs]];
                let bt = self.in_blossom[t];
                s = self.endpoint[self.label_end[bt]];
                let j = self.endpoint[self.label_end[bt] ^ 1];
                if bt >= self.n {
                    self.augment_blossom(bt, j);
                }
                self.mate[j] = self.label_end[bt];
                p = self.label_end[bt] ^ 1;
            }
        }
    }

    fn solve(&mut self, max_cardinality: bool) {
        let n = self.n;
        for _stage in 0..n {
            self.label.fill(0);
            self.best_edge.fill(NONE);
            for slot in &mut self.blossom_best_edges[n..] {
                *slot = None;
            }
            self.allow_edge.fill(false);
            self.queue.clear();

            for v in 0..n {
                if self.mate[v] == NONE && self.label[self.in_blossom[v]] == 0 {
                    self.assign_label(v, 1, NONE);
                }
            }

            let mut augmented = false;
            loop {
                while !augmented {
                    let Some(v) = self.queue.pop() else { break };
                    for idx in 0..self.neighbend[v].len() {
                        let p = self.neighbend[v][idx];
                        let k = p / 2;
                        let w = self.endpoint[p];
                        if self.in_blossom[v] == self.in_blossom[w] {
                            continue;
                        }
                        let mut kslack = 0;
                        if !self.allow_edge[k] {
                            kslack = self.slack(k);
                            if kslack <= 0 {
                                self.allow_edge[k] = true;
                            }
                        }
                        if self.allow_edge[k] {
                            if self.label[self.in_blossom[w]] == 0 {
                                self.assign_label(w, 2, p ^ 1);
                            } else if self.label[self.in_blossom[w]] == 1 {
                                let base = self.scan_blossom(v, w);
                                if base != NONE {
                                    self.add_blossom(base, k);
                                } else {
                                    self.augment_matching(k);
                                    augmented = true;
                                    break;
                                }
                            } else if self.label[w] == 0 {
                                self.label[w] = 2;
                                self.label_end[w] = p ^ 1;
                            }
                        } else if self.label[self.in_blossom[w]] == 1 {
                            let b = self.in_blossom[v];
                            if self.best_edge[b] == NONE || kslack < self.slack(self.best_edge[b]) {
                                self.best_edge[b] = k;
                            }
                        } else if self.label[w] == 0
                            && (self.best_edge[w] == NONE || kslack < self.slack(self.best_edge[w]))
                        {
                            self.best_edge[w] = k;
                        }
                    }
                }
                if augmented {
                    break;
                }

                // No augmenting path under the current duals: pick the smallest dual change.
                let mut delta_type = 0u8;
                let mut delta = 0i64;
                let mut delta_edge = NONE;
                let mut delta_blossom = NONE;
                if !max_cardinality {
                    delta_type = 1;
                    delta = self.dual[..n].iter().copied().min().unwrap_or(0);
                }
                for v in 0..n {
                    if self.label[self.in_blossom[v]] == 0 && self.best_edge[v] != NONE {
                        let d = self.slack(self.best_edge[v]);
                        if delta_type == 0 || d < delta {
                            delta = d;
                            delta_type = 2;
                            delta_edge = self.best_edge[v];
                        }
                    }
                }
                for b in 0..2 * n {
                    if self.blossom_parent[b] == NONE && self.label[b] == 1 && self.best_edge[b] != NONE {
                        let d = self.slack(self.best_edge[b]) / 2;
                        if delta_type == 0 || d < delta {
                            delta = d;
                            delta_type = 3;
                            delta_edge = self.best_edge[b];
                        }
                    }
                }
                for b in n..2 * n {
                    if self.blossom_base[b] != NONE
                        && self.blossom_parent[b] == NONE
                        && self.label[b] == 2
                        && (delta_type == 0 || self.dual[b] < delta)
                    {
                        delta = self.dual[b];
                        delta_type = 4;
                        delta_blossom = b;
                    }
                }
                if delta_type == 0 {
                    // Maximum cardinality reached; finish with a final dual adjustment.
                    delta_type = 1;
                    delta = self.dual[..n].iter().copied().min().unwrap_or(0).max(0);
                }

                for v in 0..n {
                    match self.label[self.in_blossom[v]] {
                        1 => self.dual[v] -= delta,
                        2 => self.dual[v] += delta,
                        _ => {}
                    }
                }
                for b in n..2 * n {
                    if self.blossom_base[b] != NONE && self.blossom_parent[b] == NONE {
                        match self.label[b] {
                            1 => self.dual[b] += delta,
                            2 => self.dual[b] -= delta,
                            _ => {}
                        }
                    }
                }

                match delta_type {
                    1 => break,
                    2 => {
                        self.allow_edge[delta_edge] = true;
                        let (i, j, _) = self.edges[delta_edge];
                        let i = if self.label[self.in_blossom[i]] == 0 { j } else { i };
                        self.queue.push(i);
                    }
                    3 => {
                        self.allow_edge[delta_edge] = true;
                        let (i, _, _) = self.edges[delta_edge];
                        self.queue.push(i);
                    }
                    _ => self.expand_blossom(delta_blossom, false),
                }
            }

            if !augmented {
                break;
            }

            for b in n..2 * n {
                if self.blossom_parent[b] == NONE
                    && self.blossom_base[b] != NONE
                    && self.label[b] == 1
                    && self.dual[b] == 0
                {
                    self.expand_blossom(b, true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn mates(raw: &[i64]) -> Vec<Option<usize>> {
        raw.iter().map(|&m| if m < 0 { None } else { Some(m as usize) }).collect()
    }

    fn weight_of(mate: &[Option<usize>], edges: &[(usize, usize, i64)]) -> (usize, i64) {
        let mut pairs = 0;
        let mut total = 0;
        for &(u, v, w) in edges {
            if mate[u] == Some(v) {
                assert_eq!(mate[v], Some(u), "matching must be symmetric");
                pairs += 1;
                total += w;
            }
        }
        (pairs, total)
    }

    /// Best (cardinality, weight) over all matchings, by exhaustive search.
    fn brute_force(n: usize, edges: &[(usize, usize, i64)], max_cardinality: bool) -> (usize, i64) {
        fn go(
            v: usize,
            n: usize,
            used: &mut Vec<bool>,
            adj: &[Vec<(usize, i64)>],
            acc: (usize, i64),
            best: &mut Option<(usize, i64)>,
            max_cardinality: bool,
        ) {
            if v == n {
                let better = match *best {
                    None => true,
                    Some(b) if max_cardinality => acc > b,
                    Some(b) => acc.1 > b.1,
                };
                if better {
                    *best = Some(acc);
                }
                return;
            }
            if used[v] {
                return go(v + 1, n, used, adj, acc, best, max_cardinality);
            }
            go(v + 1, n, used, adj, acc, best, max_cardinality);
            for &(u, w) in &adj[v] {
                if u > v && !used[u] {
                    used[v] = true;
                    used[u] = true;
                    go(v + 1, n, used, adj, (acc.0 + 1, acc.1 + w), best, max_cardinality);
                    used[v] = false;
                    used[u] = false;
                }
            }
        }

        let mut adj = vec![Vec::new(); n];
        for &(u, v, w) in edges {
            adj[u].push((v, w));
            adj[v].push((u, w));
        }
        let mut best = None;
        go(0, n, &mut vec![false; n], &adj, (0, 0), &mut best, max_cardinality);
        best.unwrap_or((0, 0))
    }

    #[test]
    fn test_empty_graph() {
        assert!(max_weight_matching(0, &[], false).is_empty());
        assert_eq!(max_weight_matching(3, &[], true), vec![None, None, None]);
    }

    #[test]
    fn test_single_edge() {
        assert_eq!(max_weight_matching(2, &[(0, 1, 1)], false), mates(&[1, 0]));
    }

    #[test]
    fn test_prefers_heavier_edge() {
        let edges = [(1, 2, 10), (2, 3, 11)];
        assert_eq!(max_weight_matching(4, &edges, false), mates(&[-1, -1, 3, 2]));
    }

    #[test]
    fn test_max_cardinality_overrides_weight() {
        let edges = [(1, 2, 5), (2, 3, 11), (3, 4, 5)];
        assert_eq!(max_weight_matching(5, &edges, false), mates(&[-1, -1, 3, 2, -1]));
        assert_eq!(max_weight_matching(5, &edges, true), mates(&[-1, 2, 1, 4, 3]));
    }

    #[test]
    fn test_zero_weight_edges_still_cover_with_max_cardinality() {
        let edges = [(0, 1, 0), (2, 3, 0), (0, 2, 0)];
        let mate = max_weight_matching(4, &edges, true);
        assert_eq!(weight_of(&mate, &edges).0, 2);
    }

    #[test]
    fn test_odd_cycle_forms_blossom() {
        // triangle with a pendant edge: the optimum leaves the heaviest triangle edge
        let edges = [(0, 1, 8), (0, 2, 9), (1, 2, 10), (2, 3, 7)];
        let mate = max_weight_matching(4, &edges, false);
        assert_eq!(weight_of(&mate, &edges), (2, 15));
    }

    #[test]
    fn test_matches_brute_force_on_random_graphs() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..400 {
            let n = rng.gen_range(2..=9);
            let mut edges = Vec::new();
            for u in 0..n {
                for v in (u + 1)..n {
                    if rng.gen_bool(0.6) {
                        edges.push((u, v, rng.gen_range(0..=40)));
                    }
                }
            }
            for max_cardinality in [false, true] {
                let mate = max_weight_matching(n, &edges, max_cardinality);
                let got = weight_of(&mate, &edges);
                let want = brute_force(n, &edges, max_cardinality);
                if max_cardinality {
                    assert_eq!(got, want, "edges: {edges:?}");
                } else {
                    assert_eq!(got.1, want.1, "edges: {edges:?}");
                }
            }
        }
    }
}
