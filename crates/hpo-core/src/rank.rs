//! A bounded, stably-sorted top-K list.
//!
//! Grounded in `lighttuner/hpo/utils/ranking.py`'s `RankList`: items are kept
//! sorted ascending by an effective key (the user's key negated when
//! `reverse` is set, so "best" always sorts first), ties broken by
//! insertion order, and the list is truncated from the worst end whenever it
//! grows past `capacity`.

use comfy_table::{Cell, Table};

struct Entry<T> {
    key: f64,
    seq: u64,
    item: T,
}

pub struct RankList<T> {
    capacity: usize,
    reverse: bool,
    key_fn: Box<dyn Fn(&T) -> f64 + Send + Sync>,
    columns: Vec<(String, Box<dyn Fn(&T) -> String + Send + Sync>)>,
    entries: Vec<Entry<T>>,
    next_seq: u64,
}

impl<T> RankList<T> {
    pub fn new(capacity: usize, key_fn: impl Fn(&T) -> f64 + Send + Sync + 'static, reverse: bool) -> Self {
        RankList {
            capacity: capacity.max(1),
            reverse,
            key_fn: Box::new(key_fn),
            columns: Vec::new(),
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Register an extra display column rendered by [`RankList::render`].
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        render: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        self.columns.push((name.into(), Box::new(render)));
        self
    }

    fn effective_key(&self, item: &T) -> f64 {
        let k = (self.key_fn)(item);
        if self.reverse { -k } else { k }
    }

    /// Insert `item`, keeping the list sorted and truncated to `capacity`.
    /// Returns `true` if the item is still present afterwards (it can be
    /// immediately evicted if it's worse than every retained item and the
    /// list is already full).
    pub fn append(&mut self, item: T) -> bool {
        let key = self.effective_key(&item);
        let seq = self.next_seq;
        self.next_seq += 1;

        let pos = self
            .entries
            .partition_point(|e| (e.key, e.seq) <= (key, seq));
        self.entries.insert(pos, Entry { key, seq, item });

        while self.entries.len() > self.capacity {
            self.entries.pop();
        }

        self.entries.iter().any(|e| e.seq == seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }

    pub fn best(&self) -> Option<&T> {
        self.entries.first().map(|e| &e.item)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|e| &e.item)
    }

    /// Render a PSQL-style table of the current ranking, the Rust analogue
    /// of `tabulate(..., tablefmt='psql')`.
    pub fn render(&self) -> String
    where
        T: Clone,
    {
        let mut table = Table::new();
        let mut header = vec![Cell::new("#"), Cell::new("key")];
        header.extend(self.columns.iter().map(|(name, _)| Cell::new(name)));
        table.set_header(header);

        for (i, e) in self.entries.iter().enumerate() {
            let shown_key = if self.reverse { -e.key } else { e.key };
            let mut row = vec![Cell::new((i + 1).to_string()), Cell::new(format!("{shown_key:.6}"))];
            row.extend(self.columns.iter().map(|(_, render)| Cell::new(render(&e.item))));
            table.add_row(row);
        }
        table.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_best_k_and_evicts_worst() {
        let mut rl = RankList::new(3, |x: &i32| *x as f64, false);
        for v in [5, 1, 9, 2, 8, 0] {
            rl.append(v);
        }
        let kept: Vec<_> = rl.iter().copied().collect();
        assert_eq!(kept, vec![0, 1, 2]);
    }

    #[test]
    fn reverse_keeps_largest() {
        let mut rl = RankList::new(2, |x: &i32| *x as f64, true);
        for v in [1, 5, 3, 9, 2] {
            rl.append(v);
        }
        let kept: Vec<_> = rl.iter().copied().collect();
        assert_eq!(kept, vec![9, 5]);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut rl = RankList::new(2, |_: &&str| 1.0, false);
        rl.append("first");
        rl.append("second");
        rl.append("third");
        let kept: Vec<_> = rl.iter().copied().collect();
        assert_eq!(kept, vec!["first", "second"]);
    }
}
