use crate::seq_number::SeqNumber;
use std::collections::BTreeMap;

/// Set of lost sequence numbers stored as inclusive ranges keyed by their start.
///
/// Ranges never cross the wrap point: a wrapping insert is split in two.
#[derive(Debug, Default)]
pub(crate) struct LossList {
    sequences: BTreeMap<SeqNumber, (SeqNumber, SeqNumber)>,
}

impl LossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, n1: SeqNumber, n2: SeqNumber) {
        if n1.number() > n2.number() {
            self.insert(n1, SeqNumber::max());
            self.insert(SeqNumber::zero(), n2);
            return;
        }

        // Absorb ranges starting inside (n1, n2].
        let mut end = n2;
        let absorbed: Vec<_> = self
            .sequences
            .range(n1..=n2)
            .filter(|(key, _)| **key != n1)
            .map(|(key, (_, e))| (*key, *e))
            .collect();
        for (key, e) in absorbed {
            end = std::cmp::max(end, e);
            self.sequences.remove(&key);
        }

        if let Some((_, (_start, prev_end))) = self.sequences.range_mut(..=n1).next_back() {
            if prev_end.number() + 1 >= n1.number() {
                *prev_end = std::cmp::max(*prev_end, end);
                return;
            }
        }
        self.sequences
            .entry(n1)
            .and_modify(|(_start, e)| *e = std::cmp::max(*e, end))
            .or_insert((n1, end));
    }

    pub fn remove(&mut self, num: SeqNumber) -> bool {
        if let Some((key, (start, end))) = self.sequences.range_mut(..=num).next_back() {
            if *start == num {
                let key = *key;
                let end = *end;
                self.sequences.remove(&key);
                if end > num {
                    self.sequences.insert(num + 1, (num + 1, end));
                }
                return true;
            } else if *end >= num {
                let current_end = *end;
                *end = num - 1;
                if current_end > num {
                    self.sequences.insert(num + 1, (num + 1, current_end));
                }
                return true;
            }
        }
        false
    }

    pub fn contains(&self, num: SeqNumber) -> bool {
        self.sequences
            .range(..=num)
            .next_back()
            .map(|(_, (_start, end))| *end >= num)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sequences
            .values()
            .map(|(start, end)| (end.number() - start.number()) as usize + 1)
            .sum()
    }

    /// Removes and returns the first lost number at or after `after`,
    /// wrapping around to the lowest one.
    pub fn pop_after(&mut self, after: SeqNumber) -> Option<SeqNumber> {
        if self.sequences.is_empty() {
            return None;
        }
        if self.contains(after) {
            self.remove(after);
            return Some(after);
        }
        let next = self
            .sequences
            .range(after..)
            .next()
            .or_else(|| self.sequences.iter().next())
            .map(|(_, (start, _end))| *start)?;
        self.remove(next);
        Some(next)
    }

    pub fn ranges(&self) -> impl Iterator<Item = (SeqNumber, SeqNumber)> + '_ {
        self.sequences.values().copied()
    }

}
