//! Single-kernel build loop over candidates.
//!
//! Fits each candidate with the shared basis (optionally regularized) and
//! gates it on its difference-image residuals. Build failures never
//! propagate: the candidate is marked BAD and counted.

use crate::candidate::{CandidateStatus, CandidateSwitch, KernelCandidate};
use crate::config::SolverConfig;
use crate::imstats::ImageStatistics;
use crate::kernel::KernelBasis;
use crate::solution::SolutionError;
use ndarray::Array2;
use std::sync::Arc;

pub struct SingleKernelFitVisitor {
    basis: Arc<KernelBasis>,
    config: SolverConfig,
    h: Option<Array2<f64>>,
    skip_built: bool,
    n_processed: usize,
    n_rejected: usize,
}

impl SingleKernelFitVisitor {
    pub fn new(basis: Arc<KernelBasis>, config: SolverConfig) -> Result<Self, SolutionError> {
        config.validate()?;
        Ok(Self {
            basis,
            config,
            h: None,
            skip_built: true,
            n_processed: 0,
            n_rejected: 0,
        })
    }

    pub fn with_regularization(
        basis: Arc<KernelBasis>,
        config: SolverConfig,
        h: Array2<f64>,
    ) -> Result<Self, SolutionError> {
        let mut visitor = Self::new(basis, config)?;
        visitor.h = Some(h);
        Ok(visitor)
    }

    /// When refitting candidates in a new basis (the pca pass), call with
    /// `false` so initialized candidates are processed again.
    pub fn set_skip_built(&mut self, skip: bool) {
        self.skip_built = skip;
    }

    pub fn n_processed(&self) -> usize {
        self.n_processed
    }

    pub fn n_rejected(&self) -> usize {
        self.n_rejected
    }

    pub fn process_candidates(&mut self, candidates: &mut [KernelCandidate]) {
        for candidate in candidates {
            self.process_candidate(candidate);
        }
    }

    pub fn process_candidate(&mut self, candidate: &mut KernelCandidate) {
        if self.skip_built && candidate.is_initialized() {
            return;
        }
        log::debug!(
            "processing candidate {} at {:.2} {:.2}",
            candidate.id(),
            candidate.x_center(),
            candidate.y_center()
        );

        if let Err(err) = candidate.build(&self.basis, self.h.as_ref()) {
            candidate.set_status(CandidateStatus::Bad);
            log::debug!("unable to process candidate {}: {err}", candidate.id());
            self.n_rejected += 1;
            return;
        }
        if candidate.status() == CandidateStatus::Bad {
            log::debug!("candidate {} returned BAD upon build", candidate.id());
            self.n_rejected += 1;
            return;
        }

        // Residuals come from the most recent kernel.
        let diffim = match candidate.difference_image(CandidateSwitch::Recent) {
            Ok(diffim) => diffim,
            Err(err) => {
                log::debug!(
                    "unable to make difference image for candidate {}: {err}",
                    candidate.id()
                );
                candidate.set_status(CandidateStatus::Bad);
                self.n_rejected += 1;
                return;
            }
        };
        let stats = if self.config.use_core_stats {
            ImageStatistics::apply_core(&diffim, self.config.candidate_core_radius)
        } else {
            ImageStatistics::apply(&diffim)
        };
        let stats = match stats {
            Ok(stats) => stats,
            Err(err) => {
                log::debug!(
                    "unable to calculate imstats for candidate {}: {err}",
                    candidate.id()
                );
                candidate.set_status(CandidateStatus::Bad);
                self.n_rejected += 1;
                return;
            }
        };
        self.n_processed += 1;
        candidate.set_chi2(stats.variance());
        log::debug!(
            "candidate {} resids = {:.3} +/- {:.3} sigma ({} pix)",
            candidate.id(),
            stats.mean(),
            stats.rms(),
            stats.npix()
        );

        if stats.mean().is_nan() || stats.rms().is_nan() {
            candidate.set_status(CandidateStatus::Bad);
            log::debug!("rejecting candidate {}: encountered NaN", candidate.id());
            self.n_rejected += 1;
            return;
        }

        if self.config.single_kernel_clipping {
            if stats.mean().abs() > self.config.candidate_residual_mean_max {
                candidate.set_status(CandidateStatus::Bad);
                log::debug!(
                    "rejecting candidate {}: bad mean residual |{:.3}| > {:.3}",
                    candidate.id(),
                    stats.mean(),
                    self.config.candidate_residual_mean_max
                );
                self.n_rejected += 1;
            } else if stats.rms() > self.config.candidate_residual_std_max {
                candidate.set_status(CandidateStatus::Bad);
                log::debug!(
                    "rejecting candidate {}: bad residual rms {:.3} > {:.3}",
                    candidate.id(),
                    stats.rms(),
                    self.config.candidate_residual_std_max
                );
                self.n_rejected += 1;
            } else {
                candidate.set_status(CandidateStatus::Good);
            }
        } else {
            candidate.set_status(CandidateStatus::Good);
        }
    }
}
