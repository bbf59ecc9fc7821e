use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// 指数退避，带随机抖动
/// 第 n 次失败后的等待时间为 initial * multiplier^n，不超过 max
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    /// 连续失败次数
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempts: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        self.attempts = self.attempts.saturating_add(1);

        let max = self.max.as_secs_f64();
        let base = (self.initial.as_secs_f64() * self.multiplier.powi(exponent)).min(max);
        let spread = base * self.jitter;
        let delay = match spread > 0.0 {
            true => base + rand::thread_rng().gen_range(-spread..=spread),
            false => base,
        };

        Duration::from_secs_f64(delay.clamp(0.0, max))
    }

    /// 连接成功后重新计数
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }
}
