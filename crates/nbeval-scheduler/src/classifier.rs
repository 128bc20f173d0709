//! Resource need estimation
//!
//! Notebooks rarely declare how many GPUs they use, so the need is guessed
//! from well-known device helpers appearing in their code. The guess can be
//! wrong both ways; a wrong guess costs throughput or a task failure, never
//! scheduler correctness.

/// Resources a unit of work is expected to need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceNeed {
    pub cpus: u32,
    pub gpus: u32,
}

/// Strategy estimating the resource need of a work item from its source
pub trait ResourceEstimator: Send + Sync {
    fn estimate(&self, source: &str) -> ResourceNeed;
}

/// Markers implying the work uses one GPU
pub const SINGLE_GPU_PATTERNS: &[&str] = &[
    "gpu()",
    "gpu(0)",
    "device('cuda')",
    "device('/GPU:0')",
    "try_gpu()",
    "try_gpu(0)",
];

/// Markers implying the work uses every GPU it can get
pub const ALL_GPU_PATTERNS: &[&str] = &[
    "gpu(1)",
    "device('cuda:1')",
    "device('/GPU:1')",
    "try_all_gpus",
    "try_gpu(1)",
];

/// Estimate how many GPUs `source` needs: 0, 1 or `max_gpus`
pub fn estimate_gpu_need(source: &str, max_gpus: u32) -> u32 {
    let mut gpus = 0;
    if SINGLE_GPU_PATTERNS.iter().any(|p| source.contains(p)) {
        gpus = gpus.max(1);
    }
    if ALL_GPU_PATTERNS.iter().any(|p| source.contains(p)) {
        gpus = gpus.max(max_gpus);
    }
    gpus
}

/// Substring-pattern estimator
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    max_gpus: u32,
    code_blocks_only: bool,
}

impl PatternClassifier {
    /// Estimator capping the GPU need at `max_gpus`
    pub fn new(max_gpus: u32) -> Self {
        Self {
            max_gpus,
            code_blocks_only: false,
        }
    }

    /// Only look at fenced code blocks of a markdown source
    pub fn code_blocks_only(mut self) -> Self {
        self.code_blocks_only = true;
        self
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ResourceEstimator for PatternClassifier {
    fn estimate(&self, source: &str) -> ResourceNeed {
        let gpus = if self.code_blocks_only {
            fenced_code_blocks(source)
                .iter()
                .map(|block| estimate_gpu_need(block, self.max_gpus))
                .max()
                .unwrap_or(0)
        } else {
            estimate_gpu_need(source, self.max_gpus)
        };
        ResourceNeed { cpus: 1, gpus }
    }
}

/// Bodies of the ``` fenced blocks of a markdown document
fn fenced_code_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(lines) => blocks.push(lines.join("\n")),
                None => current = Some(Vec::new()),
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    // an unterminated fence still holds code
    if let Some(lines) = current {
        blocks.push(lines.join("\n"));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_markers() {
        assert_eq!(estimate_gpu_need("x = np.arange(12)", 2), 0);
    }

    #[test]
    fn test_single_gpu_markers() {
        assert_eq!(estimate_gpu_need("net.to(d2l.try_gpu())", 4), 1);
        assert_eq!(estimate_gpu_need("with tf.device('/GPU:0'):", 4), 1);
        assert_eq!(estimate_gpu_need("x = x.to(torch.device('cuda'))", 4), 1);
    }

    #[test]
    fn test_all_gpu_markers() {
        assert_eq!(estimate_gpu_need("devices = d2l.try_all_gpus()", 2), 2);
        assert_eq!(estimate_gpu_need("y = x.copyto(npx.gpu(1))", 3), 3);
    }

    #[test]
    fn test_largest_need_wins() {
        let source = "a = try_gpu()\nb = try_gpu(1)";
        assert_eq!(estimate_gpu_need(source, 2), 2);
    }

    #[test]
    fn test_pattern_classifier_whole_text() {
        let classifier = PatternClassifier::new(2);
        let need = classifier.estimate("Call `try_all_gpus` to list every device.");
        assert_eq!(need, ResourceNeed { cpus: 1, gpus: 2 });
    }

    #[test]
    fn test_pattern_classifier_code_blocks_only() {
        let markdown = "\
Use `try_all_gpus` when several devices exist.

```{.python .input}
net.initialize(ctx=d2l.try_gpu())
```

Some prose.
";
        let classifier = PatternClassifier::new(2).code_blocks_only();
        assert_eq!(classifier.estimate(markdown).gpus, 1);
    }

    #[test]
    fn test_fenced_code_blocks() {
        let blocks = fenced_code_blocks("text\n```python\na = 1\n```\nmore\n```\nb = 2");
        assert_eq!(blocks, vec!["a = 1".to_string(), "b = 2".to_string()]);
    }
}
