//! Alignment session: the EM iteration loop and its persisted state.
//!
//! A session moves from construction (model and references built) through
//! repeated E-step, M-step and convergence check until the references stop
//! changing or the iteration cap is reached. Both endings are normal results.
//!
//! Everything that influences later iterations is held by the session and can
//! be captured in a [`Checkpoint`]: the model, the references, the per-image
//! hints, the seed and the shuffled image order. Resuming from a checkpoint
//! continues with the same results as an uninterrupted run.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::bootstrap::{bootstrap_references, shuffled_order};
use crate::config::MlConfig;
use crate::convergence::check_convergence;
use crate::distributor::TaskDistributor;
use crate::error::{MlError, Result};
use crate::expectation::{ExpectationContext, ImageHints, ImageRecord, ParticleImage};
use crate::float_trait::MlFloat;
use crate::hypothesis::{HypothesisGrid, OffsetPrior, TranslationWindow};
use crate::maximization::maximize;
use crate::model::{Model, Reference};
use crate::reference_transform::ReferenceBank;
use crate::transforms::FourierPlans;

const PROFILE_TIMING_ENV: &str = "MLALIGN_PROFILE_TIMING";

fn resolve_profile_timing() -> bool {
    std::env::var(PROFILE_TIMING_ENV)
        .ok()
        .map(|value| {
            let v = value.trim();
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

fn elapsed_ms(started: Option<Instant>) -> f64 {
    started.map_or(0.0, |t| t.elapsed().as_secs_f64() * 1e3)
}

/// Where the starting references come from.
#[derive(Debug, Clone)]
pub enum InitialReferences<F: MlFloat> {
    /// Caller-provided references, one per class.
    Supplied(Vec<Array2<F>>),
    /// Averages of `n_references` random image subsets.
    Bootstrap,
}

/// Summary of one iteration, written after every M-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationLog {
    pub iteration: usize,
    pub log_likelihood: f64,
    pub ave_pmax: f64,
    pub sigma_noise: f64,
    pub sigma_offset: f64,
    pub alpha: Vec<f64>,
    pub mirror_fraction: Vec<f64>,
    /// Signal change per reference; -1 for dead references.
    pub convergence: Vec<f64>,
    pub seed: u64,
    pub average_scale: Option<f64>,
    /// Images whose trial minimum had to be corrected.
    pub redo_count: usize,
}

/// Result of [`MlSession::step`].
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub log: IterationLog,
    /// Per-image optimal alignments, in input order.
    pub records: Vec<ImageRecord>,
    pub converged: bool,
}

/// How [`MlSession::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Converged { iterations: usize },
    MaxIterationsReached { iterations: usize },
}

/// Result of [`MlSession::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Report of the last iteration run by this call.
    pub last: Option<IterationReport>,
}

/// Persisted session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Checkpoint<F: MlFloat> {
    pub config: MlConfig,
    pub model: Model,
    pub references: Vec<Reference<F>>,
    /// Hints in input order.
    pub hints: Vec<ImageHints>,
    pub image_ids: Vec<String>,
    pub seed: u64,
    pub iteration: usize,
    pub image_order: Vec<usize>,
}

impl<F: MlFloat> Checkpoint<F> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

/// One maximum-likelihood alignment run over a fixed image set.
pub struct MlSession<F: MlFloat> {
    config: MlConfig,
    images: Vec<ParticleImage<F>>,
    model: Model,
    references: Vec<Reference<F>>,
    hints: Vec<ImageHints>,
    seed: u64,
    iteration: usize,
    image_order: Vec<usize>,
    grid: HypothesisGrid,
    plans: FourierPlans<F>,
    distributor: TaskDistributor,
    profile_timing: bool,
}

/// Check that every image is a `dim x dim` square of the first image's size.
fn common_dim<F: MlFloat>(images: &[ParticleImage<F>]) -> Result<usize> {
    let first = images.first().ok_or(MlError::EmptyImageSet)?;
    let dim = first.data.nrows();
    for image in images {
        if dim == 0 || image.data.dim() != (dim, dim) {
            return Err(MlError::DimensionMismatch {
                expected: (dim, dim),
                found: image.data.dim(),
            });
        }
    }
    Ok(dim)
}

fn check_reference_dims<F: MlFloat>(references: &[Array2<F>], dim: usize) -> Result<()> {
    for reference in references {
        if reference.dim() != (dim, dim) {
            return Err(MlError::DimensionMismatch {
                expected: (dim, dim),
                found: reference.dim(),
            });
        }
    }
    Ok(())
}

impl<F: MlFloat> MlSession<F> {
    /// Build the initial model and references.
    pub fn new(
        mut config: MlConfig,
        images: Vec<ParticleImage<F>>,
        initial: InitialReferences<F>,
    ) -> Result<Self> {
        config.validate()?;
        let dim = common_dim(&images)?;

        let seed = config.seed.unwrap_or_else(rand::random);
        config.seed = Some(seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let image_order = shuffled_order(images.len(), &mut rng);
        log::debug!("image order shuffled with seed {}", seed);

        let initial = match initial {
            InitialReferences::Supplied(refs) => {
                if refs.is_empty() {
                    return Err(MlError::InvalidConfig("no initial references supplied".to_string()));
                }
                check_reference_dims(&refs, dim)?;
                refs
            }
            InitialReferences::Bootstrap => {
                log::info!(
                    "generating {} initial references by averaging random subsets",
                    config.n_references
                );
                bootstrap_references(
                    &images,
                    &image_order,
                    config.n_references,
                    config.randomize_bootstrap_rotations,
                    &mut rng,
                )?
            }
        };
        let n_ref = initial.len();
        let start_weight = images.len() as f64 / n_ref as f64;
        let references = initial
            .into_iter()
            .map(|data| Reference {
                data,
                weight: start_weight,
            })
            .collect();

        let grid = HypothesisGrid::new(config.psi_step, config.do_mirror);
        let expected_offsets = n_ref * grid.nr_mirrors();
        let hints = images
            .iter()
            .map(|image| match &image.hints {
                Some(h) if h.offsets.len() == expected_offsets && h.opt_reference < n_ref => {
                    Ok(h.clone())
                }
                Some(_) => Err(MlError::InvalidConfig(format!(
                    "hints of image {} do not match {} references",
                    image.id, n_ref
                ))),
                None => Ok(ImageHints::initial(n_ref, grid.nr_mirrors(), config.zero_offsets)),
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Model::initial(&config, n_ref, dim);
        let distributor = TaskDistributor::new(&config)?;
        let profile_timing = config.profile_timing || resolve_profile_timing();

        log::info!(
            "session: {} images of {}x{}, {} references, {} rotations, seed {}",
            images.len(),
            dim,
            dim,
            n_ref,
            grid.nr_rotations(),
            seed
        );

        Ok(Self {
            config,
            images,
            model,
            references,
            hints,
            seed,
            iteration: 0,
            image_order,
            grid,
            plans: FourierPlans::new(dim),
            distributor,
            profile_timing,
        })
    }

    /// Continue a session from a checkpoint taken on the same images.
    pub fn resume(checkpoint: Checkpoint<F>, images: Vec<ParticleImage<F>>) -> Result<Self> {
        let Checkpoint {
            config,
            model,
            references,
            hints,
            image_ids,
            seed,
            iteration,
            image_order,
        } = checkpoint;
        config.validate()?;
        let dim = common_dim(&images)?;

        if image_ids.len() != images.len() {
            return Err(MlError::CheckpointMismatch(format!(
                "checkpoint holds {} images, {} supplied",
                image_ids.len(),
                images.len()
            )));
        }
        if let Some((expected, image)) = image_ids.iter().zip(&images).find(|(id, image)| **id != image.id) {
            return Err(MlError::CheckpointMismatch(format!(
                "expected image {}, found {}",
                expected, image.id
            )));
        }
        if hints.len() != images.len() || image_order.len() != images.len() {
            return Err(MlError::CheckpointMismatch(
                "hints or image order do not cover the image set".to_string(),
            ));
        }
        if model.dim != dim || references.len() != model.n_references() {
            return Err(MlError::CheckpointMismatch(format!(
                "model of {} references at {} pixels, images at {}",
                model.n_references(),
                model.dim,
                dim
            )));
        }
        let ref_data: Vec<Array2<F>> = references.iter().map(|r| r.data.clone()).collect();
        check_reference_dims(&ref_data, dim)?;
        model.validate()?;

        let grid = HypothesisGrid::new(config.psi_step, config.do_mirror);
        let distributor = TaskDistributor::new(&config)?;
        let profile_timing = config.profile_timing || resolve_profile_timing();
        log::info!("resuming after iteration {} with seed {}", iteration, seed);

        Ok(Self {
            config,
            images,
            model,
            references,
            hints,
            seed,
            iteration,
            image_order,
            grid,
            plans: FourierPlans::new(dim),
            distributor,
            profile_timing,
        })
    }

    pub fn config(&self) -> &MlConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn references(&self) -> &[Reference<F>] {
        &self.references
    }

    pub fn hints(&self) -> &[ImageHints] {
        &self.hints
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn image_order(&self) -> &[usize] {
        &self.image_order
    }

    /// Capture everything needed to continue this session later.
    pub fn checkpoint(&self) -> Checkpoint<F> {
        Checkpoint {
            config: self.config.clone(),
            model: self.model.clone(),
            references: self.references.clone(),
            hints: self.hints.clone(),
            image_ids: self.images.iter().map(|i| i.id.clone()).collect(),
            seed: self.seed,
            iteration: self.iteration,
            image_order: self.image_order.clone(),
        }
    }

    /// Run one E-step, M-step and convergence check.
    ///
    /// On error the session state is left as it was before the call.
    pub fn step(&mut self) -> Result<IterationReport> {
        self.model.ensure_expectation_ready()?;
        let dim = self.model.dim;
        let iteration = self.iteration + 1;

        let started = self.profile_timing.then(Instant::now);
        let bank = self.distributor.install(|| {
            ReferenceBank::build(&self.references, &self.grid, &self.plans, self.config.fast_mode)
        });
        let bank_ms = elapsed_ms(started);

        let window = TranslationWindow::new(
            self.model.sigma_offset,
            dim,
            self.config.reduced_translation_search,
            self.config.max_offset_radius,
        );
        let prior = OffsetPrior::new(self.model.sigma_offset, dim);
        let ctx = ExpectationContext {
            model: &self.model,
            bank: &bank,
            grid: &self.grid,
            window,
            prior: &prior,
            plans: &self.plans,
            fast_mode: self.config.fast_mode,
            c_fast: self.config.c_fast,
            trymindiff_factor: self.config.trymindiff_factor,
        };

        let started = self.profile_timing.then(Instant::now);
        let expectation =
            self.distributor
                .run_expectation(&ctx, &self.images, &self.hints, &self.image_order)?;
        let estep_ms = elapsed_ms(started);
        if expectation.redo_count > 0 {
            log::debug!(
                "iteration {}: trial minimum corrected for {} images",
                iteration,
                expectation.redo_count
            );
        }

        let started = self.profile_timing.then(Instant::now);
        let plans = &self.plans;
        let grid = &self.grid;
        let model = &self.model;
        let config = &self.config;
        let accumulator = &expectation.accumulator;
        let maximized = self
            .distributor
            .install(|| maximize(accumulator, model, grid, plans, config))?;
        let mstep_ms = elapsed_ms(started);

        let report = check_convergence(&self.references, &maximized.references, self.config.epsilon)?;

        for (k, (old, new)) in self.references.iter().zip(&maximized.references).enumerate() {
            if old.is_alive() && !new.is_alive() {
                log::warn!("iteration {}: reference {} received no weight", iteration, k + 1);
            }
        }

        if self.profile_timing {
            log::debug!(
                "mlalign_profile iteration={} images={} bank_ms={:.3} estep_ms={:.3} mstep_ms={:.3}",
                iteration,
                self.images.len(),
                bank_ms,
                estep_ms,
                mstep_ms
            );
        }

        self.model = maximized.model;
        self.references = maximized.references;
        self.hints = expectation.hints;
        self.iteration = iteration;

        log::info!(
            "iteration {}: LL {:.6e} <Pmax> {:.4} sigma_noise {:.5} sigma_offset {:.4} converged {}",
            iteration,
            self.model.log_likelihood,
            self.model.ave_pmax,
            self.model.sigma_noise,
            self.model.sigma_offset,
            report.converged
        );

        let log = IterationLog {
            iteration,
            log_likelihood: self.model.log_likelihood,
            ave_pmax: self.model.ave_pmax,
            sigma_noise: self.model.sigma_noise,
            sigma_offset: self.model.sigma_offset,
            alpha: self.model.alpha.clone(),
            mirror_fraction: self.model.mirror_fraction.clone(),
            convergence: report.metrics,
            seed: self.seed,
            average_scale: self.model.normalization.as_ref().map(|n| n.average_scale),
            redo_count: expectation.redo_count,
        };

        Ok(IterationReport {
            log,
            records: expectation.records,
            converged: report.converged,
        })
    }

    /// Iterate until convergence or the iteration cap.
    pub fn run(&mut self) -> Result<RunReport> {
        let mut last = None;
        while self.iteration < self.config.max_iterations {
            let report = self.step()?;
            let converged = report.converged;
            last = Some(report);
            if converged {
                log::info!("converged after {} iterations", self.iteration);
                return Ok(RunReport {
                    outcome: RunOutcome::Converged {
                        iterations: self.iteration,
                    },
                    last,
                });
            }
        }
        log::warn!(
            "no convergence within {} iterations",
            self.config.max_iterations
        );
        Ok(RunReport {
            outcome: RunOutcome::MaxIterationsReached {
                iterations: self.iteration,
            },
            last,
        })
    }
}
