//! Noise schedules and timestep respacing
//!
//! Schedules are kept as `f64` vectors: every quantity the samplers need is a
//! per-timestep scalar, and the whole batch shares one timestep.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use burn_cgd_core::CgdError;
use serde::{Deserialize, Serialize};

/// Shape of the beta schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    /// Linear betas, rescaled so any step count spans the same noise range
    #[default]
    Linear,
    /// Squared-cosine ᾱ schedule (used by the 64x64 models)
    Cosine,
}

/// Precomputed noise schedule values
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// βₜ
    pub betas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule of the given kind over `num_steps` training steps
    pub fn new(kind: BetaSchedule, num_steps: usize) -> Self {
        match kind {
            BetaSchedule::Linear => Self::linear(num_steps),
            BetaSchedule::Cosine => Self::cosine(num_steps),
        }
    }

    /// Linear beta schedule, scaled from the 1000-step reference range
    pub fn linear(num_steps: usize) -> Self {
        let scale = 1000.0 / num_steps as f64;
        Self::linear_range(num_steps, scale * 0.0001, scale * 0.02)
    }

    /// Linear beta schedule between explicit endpoints
    pub fn linear_range(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas = (0..num_steps)
            .map(|i| {
                let t = if num_steps > 1 {
                    i as f64 / (num_steps - 1) as f64
                } else {
                    0.0
                };
                beta_start + t * (beta_end - beta_start)
            })
            .collect();
        Self::from_betas(betas)
    }

    /// Squared-cosine schedule with betas capped at 0.999
    pub fn cosine(num_steps: usize) -> Self {
        let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
        let betas = (0..num_steps)
            .map(|i| {
                let t1 = i as f64 / num_steps as f64;
                let t2 = (i + 1) as f64 / num_steps as f64;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect();
        Self::from_betas(betas)
    }

    pub fn from_betas(betas: Vec<f64>) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0f64;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        Self {
            betas,
            alphas_cumprod,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    /// Keep only `use_timesteps`, recomputing betas so that ᾱ is preserved
    /// at the retained steps
    ///
    /// Returns the respaced schedule and the map from new to original indices.
    pub fn respace(&self, use_timesteps: &BTreeSet<usize>) -> (NoiseSchedule, Vec<usize>) {
        let mut last_alpha_cumprod = 1.0;
        let mut new_betas = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());

        for (i, &alpha_cumprod) in self.alphas_cumprod.iter().enumerate() {
            if use_timesteps.contains(&i) {
                new_betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
                last_alpha_cumprod = alpha_cumprod;
                timestep_map.push(i);
            }
        }

        (Self::from_betas(new_betas), timestep_map)
    }
}

/// How the training schedule is thinned for sampling
///
/// Parsed from strings such as `"250"`, `"10,15,20"` (per-section counts over
/// equal slices of the schedule) or `"ddim50"` (a uniform stride, for the
/// deterministic sampler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Respacing {
    Sections(Vec<usize>),
    Ddim(usize),
}

impl Respacing {
    /// Number of sampling steps after respacing
    pub fn count(&self) -> usize {
        match self {
            Respacing::Sections(counts) => counts.iter().sum(),
            Respacing::Ddim(n) => *n,
        }
    }

    /// Whether this respacing selects the deterministic sampler
    pub fn is_ddim(&self) -> bool {
        matches!(self, Respacing::Ddim(_))
    }

    /// Timesteps of a `num_timesteps` schedule retained by this respacing
    pub fn timesteps(&self, num_timesteps: usize) -> Result<BTreeSet<usize>, CgdError> {
        space_timesteps(num_timesteps, self)
    }
}

impl FromStr for Respacing {
    type Err = CgdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| CgdError::config(format!("invalid timestep respacing '{s}'")))
        };

        if let Some(count) = s.strip_prefix("ddim") {
            let n = parse(count)?;
            if n == 0 {
                return Err(CgdError::config("ddim respacing needs at least one step"));
            }
            return Ok(Respacing::Ddim(n));
        }

        let counts = s.split(',').map(parse).collect::<Result<Vec<_>, _>>()?;
        if counts.iter().sum::<usize>() == 0 {
            return Err(CgdError::config("timestep respacing needs at least one step"));
        }
        Ok(Respacing::Sections(counts))
    }
}

impl fmt::Display for Respacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Respacing::Sections(counts) => {
                let parts: Vec<String> = counts.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
            Respacing::Ddim(n) => write!(f, "ddim{n}"),
        }
    }
}

impl TryFrom<String> for Respacing {
    type Error = CgdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Respacing> for String {
    fn from(value: Respacing) -> Self {
        value.to_string()
    }
}

/// Select the timesteps of a `num_timesteps` schedule to keep
///
/// Section counts split the schedule into equal slices and take evenly spaced
/// (rounded) steps from each; ddim takes every k-th step where k is the stride
/// that yields exactly the requested count.
pub fn space_timesteps(
    num_timesteps: usize,
    respacing: &Respacing,
) -> Result<BTreeSet<usize>, CgdError> {
    let section_counts = match respacing {
        Respacing::Ddim(desired) => {
            for stride in 1..num_timesteps.max(2) {
                if (0..num_timesteps).step_by(stride).count() == *desired {
                    return Ok((0..num_timesteps).step_by(stride).collect());
                }
            }
            return Err(CgdError::config(format!(
                "cannot create exactly {desired} steps with an integer stride over {num_timesteps} timesteps"
            )));
        }
        Respacing::Sections(counts) => counts,
    };

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();

    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(CgdError::config(format!(
                "cannot divide section of {size} steps into {section_count}"
            )));
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            // Ties go to the even index
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }

    Ok(all_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule_endpoints() {
        let schedule = NoiseSchedule::linear(1000);
        assert_eq!(schedule.num_steps(), 1000);
        assert!((schedule.betas[0] - 0.0001).abs() < 1e-12);
        assert!((schedule.betas[999] - 0.02).abs() < 1e-12);
        // alphas_cumprod strictly decreases
        assert!(schedule
            .alphas_cumprod
            .windows(2)
            .all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_linear_schedule_rescales_with_step_count() {
        let schedule = NoiseSchedule::linear(250);
        assert!((schedule.betas[0] - 0.0004).abs() < 1e-12);
        assert!((schedule.betas[249] - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_schedule_caps_betas() {
        let schedule = NoiseSchedule::cosine(1000);
        assert!(schedule.betas.iter().all(|&b| b > 0.0 && b <= 0.999));
        assert!(schedule.alphas_cumprod[999] < 1e-3);
    }

    #[test]
    fn test_respacing_parse_and_display() {
        assert_eq!("25".parse::<Respacing>().unwrap(), Respacing::Sections(vec![25]));
        assert_eq!("ddim50".parse::<Respacing>().unwrap(), Respacing::Ddim(50));
        assert_eq!(
            "10,15".parse::<Respacing>().unwrap(),
            Respacing::Sections(vec![10, 15])
        );
        assert!("fast".parse::<Respacing>().is_err());
        assert!("ddim0".parse::<Respacing>().is_err());
        assert_eq!(Respacing::Ddim(25).to_string(), "ddim25");
        assert_eq!(Respacing::Sections(vec![10, 15]).to_string(), "10,15");
    }

    #[test]
    fn test_space_timesteps_sections() {
        let steps = space_timesteps(1000, &Respacing::Sections(vec![25])).unwrap();
        assert_eq!(steps.len(), 25);
        assert_eq!(steps.first(), Some(&0));
        assert_eq!(steps.last(), Some(&999));

        let steps = space_timesteps(10, &Respacing::Sections(vec![10])).unwrap();
        assert_eq!(steps, (0..10).collect());
    }

    #[test]
    fn test_space_timesteps_rounds_ties_to_even() {
        // Stride 2.5: the middle index 2.5 rounds down to 2
        let steps = space_timesteps(6, &Respacing::Sections(vec![3])).unwrap();
        assert_eq!(steps, [0, 2, 5].into_iter().collect());
        // Stride 1.5: the middle index 1.5 rounds up to 2
        let steps = space_timesteps(4, &Respacing::Sections(vec![3])).unwrap();
        assert_eq!(steps, [0, 2, 3].into_iter().collect());
    }

    #[test]
    fn test_space_timesteps_ddim_stride() {
        let steps = space_timesteps(1000, &Respacing::Ddim(50)).unwrap();
        assert_eq!(steps.len(), 50);
        assert!(steps.contains(&0));
        assert!(steps.contains(&20));
        assert!(steps.contains(&980));
    }

    #[test]
    fn test_space_timesteps_rejects_oversized_counts() {
        assert!(space_timesteps(25, &Respacing::Sections(vec![1000])).is_err());
        assert!(space_timesteps(25, &Respacing::Ddim(1000)).is_err());
    }

    #[test]
    fn test_respace_preserves_alpha_cumprod() {
        let base = NoiseSchedule::linear(1000);
        let keep = space_timesteps(1000, &Respacing::Sections(vec![25])).unwrap();
        let (spaced, map) = base.respace(&keep);
        assert_eq!(spaced.num_steps(), 25);
        assert_eq!(map.len(), 25);
        for (new_t, &old_t) in map.iter().enumerate() {
            let diff = spaced.alphas_cumprod[new_t] - base.alphas_cumprod[old_t];
            assert!(diff.abs() < 1e-9);
        }
    }
}
