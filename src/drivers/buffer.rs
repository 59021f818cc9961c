use ndarray::{s, Array2, ArrayView2, Axis};

/// Ordered `N x 2` window of X/Y samples, oldest row first.
pub type SampleWindow = Array2<f64>;

/// Fixed capacity X/Y history. Writes overwrite the oldest rows; reads always
/// come back in arrival order.
pub struct CircularBuffer {
    data: Array2<f64>, // capacity x 2
    /// Row the next write starts at; also the oldest row.
    head: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Array2::zeros((capacity.max(1), 2)),
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.nrows()
    }

    /// Appends `block` (rows of X/Y). A block at least as long as the buffer
    /// replaces its whole content with the block's tail.
    pub fn write(&mut self, block: ArrayView2<f64>) {
        let capacity = self.capacity();
        let len = block.nrows();
        if len >= capacity {
            self.data.assign(&block.slice(s![len - capacity.., ..]));
            self.head = 0;
            return;
        }
        let first = len.min(capacity - self.head);
        self.data
            .slice_mut(s![self.head..self.head + first, ..])
            .assign(&block.slice(s![..first, ..]));
        self.data
            .slice_mut(s![..len - first, ..])
            .assign(&block.slice(s![first.., ..]));
        self.head = (self.head + len) % capacity;
    }

    /// Last `k` rows in arrival order; rows never written read as zero.
    /// `k` is clamped to the capacity.
    pub fn read(&self, k: usize) -> SampleWindow {
        let capacity = self.capacity();
        let k = k.min(capacity);
        let start = (self.head + capacity - k) % capacity;
        let mut out = Array2::zeros((k, 2));
        let first = k.min(capacity - start);
        out.slice_mut(s![..first, ..])
            .assign(&self.data.slice(s![start..start + first, ..]));
        out.slice_mut(s![first.., ..])
            .assign(&self.data.slice(s![..k - first, ..]));
        out
    }

    pub fn reset(&mut self) {
        self.data.fill(0.0);
        self.head = 0;
    }

    /// Mean X/Y over the last `k` rows.
    pub fn mean(&self, k: usize) -> [f64; 2] {
        let window = self.read(k);
        match window.mean_axis(Axis(0)) {
            Some(mean) => [mean[0], mean[1]],
            None => [0.0, 0.0],
        }
    }
}
