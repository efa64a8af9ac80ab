// Fetch and replacement policies
// ------------------------------
// The pager drives a replacement policy through four hooks: `on_map` when a
// page is brought in, `on_unmap` when its frame leaves residency, `on_access`
// on every translated read/write, and `pick_victim` when the allocator runs
// dry. Victim selection takes an eligibility predicate so the pager can veto
// page-table frames, shared frames, and the faulting page itself.

use rand::Rng;

/// When pages are materialised: on first touch, or all at map time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPolicy {
    Demand,
    Eager,
}

/// Which replacement algorithm backs `pick_victim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictPolicy {
    Clock,
    Lru,
    Random,
}

impl EvictPolicy {
    pub fn build(self) -> Box<dyn ReplacementPolicy> {
        match self {
            EvictPolicy::Clock => Box::new(ClockPolicy::default()),
            EvictPolicy::Lru => Box::new(LruPolicy::default()),
            EvictPolicy::Random => Box::new(RandomPolicy::default()),
        }
    }
}

pub trait ReplacementPolicy: Send {
    /// A page was brought into `frame`.
    fn on_map(&mut self, frame: usize);
    /// `frame` left residency (evicted or freed).
    fn on_unmap(&mut self, frame: usize);
    /// Any translated read or write touched `frame`.
    fn on_access(&mut self, frame: usize);
    /// Choose a victim among resident frames for which `eligible` holds.
    fn pick_victim(&mut self, eligible: &dyn Fn(usize) -> bool) -> Option<usize>;
}

/// Second-chance sweep over a circular list of resident frames. The sweep
/// clears accessed bits as it passes; a frame is taken the second time the
/// hand reaches it unaccessed.
#[derive(Debug, Default)]
pub struct ClockPolicy {
    ring: Vec<usize>,
    hand: usize,
    referenced: Vec<bool>,
}

impl ReplacementPolicy for ClockPolicy {
    fn on_map(&mut self, frame: usize) {
        self.ring.push(frame);
        self.referenced.push(true);
    }

    fn on_unmap(&mut self, frame: usize) {
        if let Some(i) = self.ring.iter().position(|&f| f == frame) {
            self.ring.remove(i);
            self.referenced.remove(i);
            if self.hand > i {
                self.hand -= 1;
            }
            if !self.ring.is_empty() {
                self.hand %= self.ring.len();
            } else {
                self.hand = 0;
            }
        }
    }

    fn on_access(&mut self, frame: usize) {
        if let Some(i) = self.ring.iter().position(|&f| f == frame) {
            self.referenced[i] = true;
        }
    }

    fn pick_victim(&mut self, eligible: &dyn Fn(usize) -> bool) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        // Two full sweeps suffice: the first clears accessed bits, the
        // second must find any eligible frame.
        for _ in 0..self.ring.len() * 2 {
            let i = self.hand;
            self.hand = (self.hand + 1) % self.ring.len();
            if !eligible(self.ring[i]) {
                continue;
            }
            if self.referenced[i] {
                self.referenced[i] = false;
            } else {
                return Some(self.ring[i]);
            }
        }
        None
    }
}

/// Strict recency order: every access moves the frame to the back; the
/// victim is the least recently used eligible frame.
#[derive(Debug, Default)]
pub struct LruPolicy {
    order: Vec<usize>,
}

impl ReplacementPolicy for LruPolicy {
    fn on_map(&mut self, frame: usize) {
        self.order.push(frame);
    }

    fn on_unmap(&mut self, frame: usize) {
        self.order.retain(|&f| f != frame);
    }

    fn on_access(&mut self, frame: usize) {
        if let Some(i) = self.order.iter().position(|&f| f == frame) {
            let f = self.order.remove(i);
            self.order.push(f);
        }
    }

    fn pick_victim(&mut self, eligible: &dyn Fn(usize) -> bool) -> Option<usize> {
        self.order.iter().copied().find(|&f| eligible(f))
    }
}

/// Uniformly random choice among eligible resident frames.
#[derive(Debug, Default)]
pub struct RandomPolicy {
    resident: Vec<usize>,
}

impl ReplacementPolicy for RandomPolicy {
    fn on_map(&mut self, frame: usize) {
        self.resident.push(frame);
    }

    fn on_unmap(&mut self, frame: usize) {
        self.resident.retain(|&f| f != frame);
    }

    fn on_access(&mut self, _frame: usize) {}

    fn pick_victim(&mut self, eligible: &dyn Fn(usize) -> bool) -> Option<usize> {
        let candidates: Vec<usize> =
            self.resident.iter().copied().filter(|&f| eligible(f)).collect();
        if candidates.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rotates_under_uniform_access() {
        let mut clock = ClockPolicy::default();
        for f in 0..4 {
            clock.on_map(f);
        }

        // Everything referenced: the first pick sweeps bits clear and takes
        // the frame the hand started at; with uniform re-reference between
        // picks the victims rotate round-robin within one sweep.
        let mut victims = Vec::new();
        for _ in 0..4 {
            for f in 0..4 {
                if !victims.contains(&f) {
                    clock.on_access(f);
                }
            }
            let v = clock.pick_victim(&|f| !victims.contains(&f)).unwrap();
            clock.on_unmap(v);
            victims.push(v);
        }
        assert_eq!(victims, vec![0, 1, 2, 3]);
    }

    #[test]
    fn clock_prefers_unreferenced() {
        let mut clock = ClockPolicy::default();
        for f in 0..3 {
            clock.on_map(f);
        }
        // Only frame 1 goes unreferenced after the initial sweep.
        let first = clock.pick_victim(&|_| true).unwrap();
        assert_eq!(first, 0); // initial full-sweep clear, hand at start
        clock.on_unmap(first);

        clock.on_access(2);
        let second = clock.pick_victim(&|_| true).unwrap();
        assert_eq!(second, 1);
    }

    #[test]
    fn lru_evicts_least_recent() {
        let mut lru = LruPolicy::default();
        for f in 0..3 {
            lru.on_map(f);
        }
        lru.on_access(0);
        assert_eq!(lru.pick_victim(&|_| true), Some(1));
    }

    #[test]
    fn random_respects_eligibility() {
        let mut random = RandomPolicy::default();
        for f in 0..8 {
            random.on_map(f);
        }
        for _ in 0..32 {
            let v = random.pick_victim(&|f| f % 2 == 0).unwrap();
            assert_eq!(v % 2, 0);
        }
        assert_eq!(random.pick_victim(&|_| false), None);
    }
}
