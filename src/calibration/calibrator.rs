use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Duration, Instant};

use super::*;
use crate::cancellation::CancelToken;
use crate::live::poller::MODE_SWITCH_GRACE;
use crate::live::{LiveEvent, LivePoller, PollChannel, PollKind};

/// Runs calibration attempts against one session's poller.
pub struct AutoCalibrator {
    poller: Arc<LivePoller>,
    session_token: CancelToken,
    running: AtomicBool,
    attempt: Mutex<Option<CancelToken>>,
    sample_interval: Duration,
    window: Duration,
}

/// Clears the running flag however the attempt ends.
struct RunGuard<'a> {
    calibrator: &'a AutoCalibrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut attempt) = self.calibrator.attempt.lock() {
            *attempt = None;
        }
        self.calibrator.running.store(false, Ordering::SeqCst);
    }
}

impl AutoCalibrator {
    pub fn new(poller: Arc<LivePoller>, session_token: CancelToken) -> Self {
        Self {
            poller,
            session_token,
            running: AtomicBool::new(false),
            attempt: Mutex::new(None),
            sample_interval: SAMPLE_INTERVAL,
            window: PHASE_WINDOW,
        }
    }

    pub fn with_timing(mut self, sample_interval: Duration, window: Duration) -> Self {
        self.sample_interval = sample_interval;
        self.window = window;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Abort the running attempt, if any.
    pub fn cancel(&self) {
        if let Ok(attempt) = self.attempt.lock() {
            if let Some(token) = attempt.as_ref() {
                token.cancel();
            }
        }
    }

    /// Run rest then full-travel sampling. `progress` sees every phase change
    /// and every accepted sample, ending with `Complete` or `Aborted`.
    pub async fn run<F>(&self, mut progress: F) -> Result<CalibrationResult, CalibrationError>
    where
        F: FnMut(CalibrationProgress),
    {
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(CalibrationError::Busy);
        }
        let attempt = CancelToken::new();
        if let Ok(mut slot) = self.attempt.lock() {
            *slot = Some(attempt.clone());
        }
        let _guard = RunGuard { calibrator: self };
        let resume = self.poller.poll_interval(PollChannel::AxisValue).await;

        log::info!("Starting whammy calibration");
        let outcome = self.run_phases(&attempt, &mut progress).await;
        self.resume_axis_poll(resume).await;
        let window_ms = self.window.as_millis() as u64;
        match &outcome {
            Ok(result) => {
                log::info!("Calibration complete: {}..{}", result.min, result.max);
                progress(CalibrationProgress {
                    phase: CalibrationPhase::Complete,
                    samples: result.full.count,
                    elapsed_ms: window_ms,
                    window_ms,
                    latest: None,
                });
            }
            Err(e) => {
                log::warn!("Calibration aborted: {}", e);
                progress(CalibrationProgress {
                    phase: CalibrationPhase::Aborted(e.reason()),
                    samples: 0,
                    elapsed_ms: 0,
                    window_ms,
                    latest: None,
                });
            }
        }
        outcome
    }

    /// Put back the axis poll a diagnostics view had running before the attempt.
    async fn resume_axis_poll(&self, interval: Option<Duration>) {
        let Some(interval) = interval else { return };
        if self.poller.is_session_closed() {
            return;
        }
        if let Err(e) = self.poller.start_polling(PollKind::AxisValue, interval).await {
            log::warn!("Could not resume axis polling after calibration: {}", e);
        }
    }

    async fn run_phases<F>(&self, attempt: &CancelToken, progress: &mut F) -> Result<CalibrationResult, CalibrationError>
    where
        F: FnMut(CalibrationProgress),
    {
        let rest = self.sample_phase(CalibrationPhase::SamplingRest, attempt, progress).await?;
        let full = self.sample_phase(CalibrationPhase::SamplingFull, attempt, progress).await?;
        Ok(CalibrationResult::from_stats(rest, full))
    }

    /// One timed window with its own buffer, subscription and poller.
    async fn sample_phase<F>(
        &self,
        phase: CalibrationPhase,
        attempt: &CancelToken,
        progress: &mut F,
    ) -> Result<SampleStats, CalibrationError>
    where
        F: FnMut(CalibrationProgress),
    {
        let window_ms = self.window.as_millis() as u64;
        progress(CalibrationProgress { phase: phase.clone(), samples: 0, elapsed_ms: 0, window_ms, latest: None });

        if self.poller.is_active(PollChannel::AxisValue) {
            let _ = self.poller.stop_polling(PollChannel::AxisValue).await;
        }
        // Replies to an earlier window's polls drain before this one listens.
        tokio::time::sleep(MODE_SWITCH_GRACE).await;
        let events = self.poller.subscribe();
        if let Err(e) = self.poller.start_polling(PollKind::AxisValue, self.sample_interval).await {
            return Err(if self.session_token.is_cancelled() {
                CalibrationError::DeviceLost
            } else {
                CalibrationError::Poller(e.to_string())
            });
        }

        let collected = self.collect(&phase, events, attempt, progress).await;
        let _ = self.poller.stop_polling(PollChannel::AxisValue).await;
        let samples = collected?;
        if samples.is_empty() && self.poller.is_session_closed() {
            return Err(CalibrationError::DeviceLost);
        }

        log::debug!("{:?} collected {} samples", phase, samples.len());
        SampleStats::from_samples(&samples).ok_or(CalibrationError::NoSamples { phase })
    }

    async fn collect<F>(
        &self,
        phase: &CalibrationPhase,
        mut events: broadcast::Receiver<LiveEvent>,
        attempt: &CancelToken,
        progress: &mut F,
    ) -> Result<Vec<i32>, CalibrationError>
    where
        F: FnMut(CalibrationProgress),
    {
        let started = Instant::now();
        let deadline = started + self.window;
        let window_ms = self.window.as_millis() as u64;
        let mut samples = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = self.session_token.cancelled() => return Err(CalibrationError::DeviceLost),
                _ = attempt.cancelled() => return Err(CalibrationError::Cancelled),
                _ = sleep_until(deadline) => return Ok(samples),
                evt = events.recv() => match evt {
                    // -1 means no whammy is fitted
                    Ok(LiveEvent::Whammy { value }) if value >= 0 => {
                        samples.push(value);
                        progress(CalibrationProgress {
                            phase: phase.clone(),
                            samples: samples.len(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            window_ms,
                            latest: Some(value),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Calibration listener lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(CalibrationError::DeviceLost),
                }
            }
        }
    }
}
