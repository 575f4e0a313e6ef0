//! Real-time pose refinement and robust estimation on matrix Lie groups.
//!
//! `pose-servo` is the geometric core of a pose-tracking / visual-odometry
//! pipeline: given correspondences between a known model and an observed
//! image — points, directions, planar patches, photometric samples — it
//! recovers the rigid (SE3), rotational (SO3) or planar projective (SL3)
//! transformation that best explains them and keeps the estimate updated
//! frame to frame.
//!
//! Two cooperating subsystems:
//! - the **refinement engine** ([`vvs`]): iteratively reweighted nonlinear
//!   least squares over a tangent-space parameterization, with robust
//!   M-estimation ([`robust`]), pluggable residual models ([`residual`]) and
//!   a Cholesky/SVD normal-equation backend ([`linalg`]);
//! - the **consensus bank** ([`ransac`]): minimal solvers (P3P, five-point
//!   essential, four-point homography, seven-point multi-camera rig) driven
//!   by an adaptive RANSAC loop that bootstraps the refinement engine from
//!   outlier-contaminated correspondence sets.
//!
//! Everything runs to completion within one synchronous call; optional
//! data-parallelism fans correspondence evaluation across rayon.
//!
//! ```no_run
//! use nalgebra::{Vector2, Vector3};
//! use pose_servo::manifold::{LieGroup, SE3};
//! use pose_servo::residual::{PointCorrespondence, PointReprojection, RefinementState};
//! use pose_servo::vvs::VvsSolver;
//!
//! let correspondences = vec![
//!     PointCorrespondence::from_image_point(Vector3::new(0.0, 0.0, 4.0), Vector2::new(0.01, 0.0)),
//!     // ... one entry per tracked feature
//! ];
//! let model = PointReprojection::new(correspondences);
//! let mut state = RefinementState::new(SE3::identity());
//! let report = VvsSolver::new().refine(&mut state, &model).unwrap();
//! println!("{report}");
//! ```

pub mod assembler;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod ransac;
pub mod residual;
pub mod robust;
pub mod vvs;

pub use assembler::{AccumulationStrategy, NormalEquations};
pub use error::{ServoError, ServoResult};
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{LieGroup, ManifoldType, Parameterization, Transform, SE3, SL3, SO3};
pub use ransac::{MinimalSolver, Ransac, RansacConfig, RansacEstimate};
pub use residual::{Evaluation, RefinementState, ResidualModel};
pub use robust::MEstimator;
pub use vvs::{VvsConfig, VvsReport, VvsSolver, VvsStatus};
