/// Depth calculates minimum, maximum, average and percentile of
/// leaf-node depth in a tree, sampled by the validation walks.
///
/// Under relaxed balance the histogram is the observable that matters:
/// rotations and splays only promise to keep it shallow, not to keep
/// the strict AVL shape at every instant.
#[derive(Clone)]
pub struct Depth {
    samples: usize,
    min: usize,
    max: usize,
    total: usize,
    depths: [u64; 256],
}

impl Depth {
    pub(crate) fn sample(&mut self, depth: usize) {
        self.samples += 1;
        self.total += depth;
        if self.min == 0 || self.min > depth {
            self.min = depth
        }
        if self.max == 0 || self.max < depth {
            self.max = depth
        }
        self.depths[depth.min(255)] += 1;
    }

    /// Return number of leaf-node samples in this histogram.
    pub fn to_samples(&self) -> usize {
        self.samples
    }

    /// Return minimum depth of sampled leaf-nodes.
    pub fn to_min(&self) -> usize {
        self.min
    }

    /// Return the average depth of sampled leaf-nodes.
    pub fn to_mean(&self) -> usize {
        if self.samples == 0 {
            0
        } else {
            self.total / self.samples
        }
    }

    /// Return maximum depth of sampled leaf-nodes.
    pub fn to_max(&self) -> usize {
        self.max
    }

    /// Return depth as tuple of percentiles, each tuple provides
    /// (percentile, depth). Returned percentiles from 90, 91 .. 99
    pub fn to_percentiles(&self) -> Vec<(u8, usize)> {
        let mut percentiles: Vec<(u8, usize)> = vec![];
        let (mut acc, mut prev_perc) = (0_u64, 90_u8);
        let iter = self.depths.iter().enumerate().filter(|(_, &item)| item > 0);
        for (depth, samples) in iter {
            acc += *samples;
            let perc = ((acc as f64 / (self.samples as f64)) * 100_f64) as u8;
            if perc >= prev_perc {
                percentiles.push((perc, depth));
                prev_perc = perc;
            }
        }
        percentiles
    }

    pub fn pretty_print(&self, prefix: &str) {
        let mean = self.to_mean();
        println!(
            "{}depth (min, mean, max): {:?}",
            prefix,
            (self.min, mean, self.max)
        );
        for (depth, n) in self.to_percentiles().into_iter() {
            if n > 0 {
                println!("{}  {} percentile = {}", prefix, depth, n);
            }
        }
    }

    pub fn to_json_text(&self) -> String {
        let ps: Vec<String> = self
            .to_percentiles()
            .into_iter()
            .map(|(d, n)| format!("{}: {}", d, n))
            .collect();
        let strs = [
            format!("min: {}", self.to_min()),
            format!("mean: {}", self.to_mean()),
            format!("max: {}", self.to_max()),
            format!("percentiles: {}", ps.join(", ")),
        ];
        ("{ ".to_string() + strs.join(", ").as_str() + " }").to_string()
    }
}

impl Default for Depth {
    fn default() -> Self {
        Depth {
            samples: 0,
            min: 0,
            max: 0,
            total: 0,
            depths: [0; 256],
        }
    }
}
