use stagefeed_core::DeviceId;
use stagefeed_gpu::DeviceSet;

/// Ordered (source, target) device pairs for cross-device runs.
///
/// Every pair is visited, including a device paired with itself.
#[derive(Debug, Clone)]
pub struct DevicePairs {
    devices: Vec<DeviceId>,
}

impl DevicePairs {
    pub fn new(devices: Vec<DeviceId>) -> Self {
        Self { devices }
    }

    /// GPUs `0..count` only.
    pub fn gpus(count: usize) -> Self {
        Self::new((0..count).map(DeviceId::Gpu).collect())
    }

    /// The host and every GPU of `devices`.
    pub fn all(devices: &DeviceSet) -> Self {
        Self::new(devices.devices().collect())
    }

    pub fn len(&self) -> usize {
        self.devices.len() * self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, DeviceId)> + '_ {
        self.devices
            .iter()
            .flat_map(move |&src| self.devices.iter().map(move |&dst| (src, dst)))
    }

    /// Distribute the pairs round-robin over `workers` groups.
    ///
    /// Empty groups are dropped, so fewer than `workers` groups come back
    /// when there are fewer pairs than workers.
    pub fn schedule(&self, workers: usize) -> Vec<Vec<(DeviceId, DeviceId)>> {
        let workers = workers.max(1);
        let mut groups: Vec<Vec<(DeviceId, DeviceId)>> = vec![Vec::new(); workers];
        for (i, pair) in self.iter().enumerate() {
            groups[i % workers].push(pair);
        }
        groups.retain(|g| !g.is_empty());

        tracing::debug!(
            pairs = self.len(),
            groups = groups.len(),
            "scheduled device pairs"
        );
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_diagonal() {
        let pairs: Vec<_> = DevicePairs::gpus(2).iter().collect();
        assert_eq!(
            pairs,
            vec![
                (DeviceId::Gpu(0), DeviceId::Gpu(0)),
                (DeviceId::Gpu(0), DeviceId::Gpu(1)),
                (DeviceId::Gpu(1), DeviceId::Gpu(0)),
                (DeviceId::Gpu(1), DeviceId::Gpu(1)),
            ]
        );
    }

    #[test]
    fn schedule_round_robin() {
        let groups = DevicePairs::gpus(3).schedule(4);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 9);
        assert_eq!(groups[0].len(), 3);

        let groups = DevicePairs::gpus(1).schedule(8);
        assert_eq!(groups.len(), 1);
    }
}
