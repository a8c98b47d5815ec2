//! Behavior evaluator (§4.3): distance of a session embedding from a rolling
//! per-user behavioral centroid.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use crate::context::{DeviceType, LoginEvent, Session, User};

pub const EMBEDDING_DIM: usize = 16;
pub type Embedding = [f64; EMBEDDING_DIM];

/// Default for `BehaviorEvaluator::new` when no override is configured;
/// overridable at runtime via `ServiceConfig::behavior_min_sessions`
/// (`BEHAVIOR_MIN_SESSIONS`).
pub const DEFAULT_MIN_SESSIONS_FOR_PROFILE: usize = 5;
const MAX_HISTORY_SESSIONS: usize = 100;
const DECAY_FACTOR: f64 = 0.95;
const COVARIANCE_REGULARIZATION: f64 = 1e-4;
const EPSILON: f64 = 1e-10;

const COSINE_LOW: f64 = 0.1;
const COSINE_HIGH: f64 = 0.5;
const MAHAL_LOW: f64 = 2.0;
const MAHAL_HIGH: f64 = 4.0;
const EUCLIDEAN_LOW: f64 = 1.0;
const EUCLIDEAN_HIGH: f64 = 3.0;
const NORM_LOW_WEIGHT: f64 = 0.3;
const NORM_HIGH_WEIGHT: f64 = 0.7;

const ANOMALY_LOW: f64 = 0.3;
const TIME_DIFF_THRESH: f64 = 0.5;
const DAY_DIFF_THRESH: f64 = 0.5;
const DEVICE_DIFF_THRESH: f64 = 0.5;
const AUTH_DIFF_THRESH: f64 = 0.5;
const LOC_DIFF_THRESH: f64 = 0.3;
const VPN_THRESH: f64 = 0.5;
const TOR_THRESH: f64 = 0.5;
const GAP_THRESH: f64 = 0.5;
const FALLBACK_ANOMALY: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorEvaluation {
    pub match_score: f64,
    pub deviations: Vec<String>,
}

/// Builds the 16-dimensional session embedding (§4.3).
pub fn build_embedding(login_event: &LoginEvent, session: &Session, device_type: DeviceType) -> Embedding {
    let hour = session.start_time.hour() as f64;
    let weekday = session.start_time.weekday().num_days_from_monday() as f64;

    let mut v = [0.0; EMBEDDING_DIM];
    v[0] = (2.0 * std::f64::consts::PI * hour / 24.0).sin();
    v[1] = (2.0 * std::f64::consts::PI * hour / 24.0).cos();
    v[2] = (2.0 * std::f64::consts::PI * weekday / 7.0).sin();
    v[3] = (2.0 * std::f64::consts::PI * weekday / 7.0).cos();

    v[4 + device_type.one_hot_index()] = 1.0;
    v[7 + login_event.auth_method.one_hot_index()] = 1.0;

    v[11] = (session.geo_location.latitude / 90.0).clamp(-1.0, 1.0);
    v[12] = (session.geo_location.longitude / 180.0).clamp(-1.0, 1.0);

    v[13] = if session.is_vpn { 1.0 } else { 0.0 };
    v[14] = if session.is_tor { 1.0 } else { 0.0 };

    v[15] = match login_event.time_since_last_login_hours {
        Some(hours) => (hours.max(0.0).ln_1p() / 7.0).min(1.0),
        None => 0.5,
    };

    v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMethod {
    Cosine,
    Mahalanobis,
    Euclidean,
}

type Matrix = Vec<Vec<f64>>;

#[derive(Debug, Clone)]
pub struct BehavioralProfile {
    pub centroid: Embedding,
    pub covariance_inv: Option<Matrix>,
    pub session_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    history: VecDeque<Embedding>,
}

impl BehavioralProfile {
    pub fn empty() -> Self {
        Self {
            centroid: [0.0; EMBEDDING_DIM],
            covariance_inv: None,
            session_count: 0,
            last_updated: None,
            history: VecDeque::new(),
        }
    }

    pub fn is_valid(&self, min_sessions: usize) -> bool {
        self.session_count >= min_sessions
    }

    /// EMA centroid update plus rolling, decay-weighted, regularized
    /// covariance re-estimation (§4.3).
    pub fn update(&mut self, embedding: Embedding, when: DateTime<Utc>, min_sessions: usize) {
        self.history.push_back(embedding);
        while self.history.len() > MAX_HISTORY_SESSIONS {
            self.history.pop_front();
        }

        let alpha = if self.session_count < 10 {
            1.0 / (self.session_count as f64 + 1.0)
        } else {
            0.1
        };
        for i in 0..EMBEDDING_DIM {
            self.centroid[i] = (1.0 - alpha) * self.centroid[i] + alpha * embedding[i];
        }
        self.session_count += 1;
        self.last_updated = Some(when);

        if self.history.len() >= min_sessions {
            self.recompute_covariance();
        }
    }

    fn recompute_covariance(&mut self) {
        if self.history.len() < 2 {
            return;
        }
        let n = self.history.len();
        let weights: Vec<f64> = (0..n).map(|i| DECAY_FACTOR.powi(i as i32)).collect();
        let weight_sum: f64 = weights.iter().sum();
        let weights: Vec<f64> = weights.iter().map(|w| w / weight_sum).collect();

        let vectors: Vec<Embedding> = self.history.iter().rev().copied().collect();

        let mut cov = vec![vec![0.0; EMBEDDING_DIM]; EMBEDDING_DIM];
        for (vec, &w) in vectors.iter().zip(weights.iter()) {
            let mut centered = [0.0; EMBEDDING_DIM];
            for i in 0..EMBEDDING_DIM {
                centered[i] = vec[i] - self.centroid[i];
            }
            for i in 0..EMBEDDING_DIM {
                for j in 0..EMBEDDING_DIM {
                    cov[i][j] += w * centered[i] * centered[j];
                }
            }
        }
        // Bias correction matching numpy's aweights behaviour isn't
        // reproduced exactly here; the regularization term below dominates
        // numerical stability, which is what the inversion depends on.
        for i in 0..EMBEDDING_DIM {
            cov[i][i] += COVARIANCE_REGULARIZATION;
        }

        self.covariance_inv = invert(&cov).or_else(|| pseudo_inverse(&cov));
    }
}

fn invert(matrix: &Matrix) -> Option<Matrix> {
    let n = matrix.len();
    let mut a = matrix.clone();
    let mut inv = identity(n);

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > pivot_val {
                pivot_row = row;
                pivot_val = a[row][col].abs();
            }
        }
        if pivot_val < 1e-12 {
            return None;
        }
        a.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = a[col][col];
        for j in 0..n {
            a[col][j] /= pivot;
            inv[col][j] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

/// Approximate pseudo-inverse fallback for singular covariance matrices:
/// increases the regularization term until the matrix is invertible. A full
/// SVD-based Moore-Penrose pseudo-inverse is out of scope without a linear
/// algebra dependency the rest of the stack doesn't otherwise need.
fn pseudo_inverse(matrix: &Matrix) -> Option<Matrix> {
    let n = matrix.len();
    let mut reg = COVARIANCE_REGULARIZATION;
    for _ in 0..8 {
        reg *= 10.0;
        let mut candidate = matrix.clone();
        for i in 0..n {
            candidate[i][i] += reg;
        }
        if let Some(inv) = invert(&candidate) {
            return Some(inv);
        }
    }
    None
}

fn identity(n: usize) -> Matrix {
    let mut m = vec![vec![0.0; n]; n];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

#[derive(Debug, Clone)]
pub struct AnomalyScore {
    pub normalized_score: f64,
    pub method: DistanceMethod,
}

fn cosine_distance(a: &Embedding, b: &Embedding) -> f64 {
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a < EPSILON || norm_b < EPSILON {
        return 1.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot / (norm_a * norm_b)
}

fn euclidean_distance(a: &Embedding, b: &Embedding) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn mahalanobis_distance(x: &Embedding, mu: &Embedding, cov_inv: &Matrix) -> f64 {
    let diff: Vec<f64> = x.iter().zip(mu.iter()).map(|(a, b)| a - b).collect();
    let mut temp = vec![0.0; diff.len()];
    for i in 0..diff.len() {
        for j in 0..diff.len() {
            temp[i] += cov_inv[i][j] * diff[j];
        }
    }
    let quad: f64 = diff.iter().zip(temp.iter()).map(|(d, t)| d * t).sum();
    quad.max(0.0).sqrt()
}

fn piecewise_normalize(distance: f64, low: f64, high: f64) -> f64 {
    if distance <= low {
        distance / low * NORM_LOW_WEIGHT
    } else if distance >= high {
        1.0
    } else {
        let ratio = (distance - low) / (high - low);
        NORM_LOW_WEIGHT + ratio * NORM_HIGH_WEIGHT
    }
}

fn identify_deviations(current: &Embedding, centroid: &Embedding, anomaly_score: f64) -> Vec<String> {
    if anomaly_score < ANOMALY_LOW {
        return Vec::new();
    }
    let diff: Vec<f64> = current.iter().zip(centroid.iter()).map(|(a, b)| (a - b).abs()).collect();
    let mut deviations = Vec::new();

    let time_diff = (diff[0].powi(2) + diff[1].powi(2)).sqrt();
    if time_diff > TIME_DIFF_THRESH {
        deviations.push("login_time_differs_from_usual".to_string());
    }
    let day_diff = (diff[2].powi(2) + diff[3].powi(2)).sqrt();
    if day_diff > DAY_DIFF_THRESH {
        deviations.push("login_day_differs_from_usual".to_string());
    }
    let device_diff = diff[4..7].iter().cloned().fold(0.0, f64::max);
    if device_diff > DEVICE_DIFF_THRESH {
        deviations.push("different_device_type_than_usual".to_string());
    }
    let auth_diff = diff[7..11].iter().cloned().fold(0.0, f64::max);
    if auth_diff > AUTH_DIFF_THRESH {
        deviations.push("different_auth_method_than_usual".to_string());
    }
    let loc_diff = (diff[11].powi(2) + diff[12].powi(2)).sqrt();
    if loc_diff > LOC_DIFF_THRESH {
        deviations.push("login_location_differs_from_usual".to_string());
    }
    if diff[13] > VPN_THRESH {
        deviations.push("unusual_vpn_usage".to_string());
    }
    if diff[14] > TOR_THRESH {
        deviations.push("unusual_tor_usage".to_string());
    }
    if diff[15] > GAP_THRESH {
        deviations.push("unusual_gap_between_logins".to_string());
    }

    if deviations.is_empty() && anomaly_score >= FALLBACK_ANOMALY {
        deviations.push("overall_behavioral_pattern_differs_significantly".to_string());
    }
    deviations
}

fn compute_anomaly(embedding: &Embedding, profile: &BehavioralProfile, preferred: DistanceMethod) -> AnomalyScore {
    match preferred {
        DistanceMethod::Mahalanobis => {
            if let Some(cov_inv) = &profile.covariance_inv {
                let distance = mahalanobis_distance(embedding, &profile.centroid, cov_inv);
                return AnomalyScore {
                    normalized_score: piecewise_normalize(distance, MAHAL_LOW, MAHAL_HIGH),
                    method: DistanceMethod::Mahalanobis,
                };
            }
            let distance = euclidean_distance(embedding, &profile.centroid);
            AnomalyScore {
                normalized_score: piecewise_normalize(distance, EUCLIDEAN_LOW, EUCLIDEAN_HIGH),
                method: DistanceMethod::Euclidean,
            }
        }
        DistanceMethod::Cosine => {
            let distance = cosine_distance(embedding, &profile.centroid);
            AnomalyScore {
                normalized_score: piecewise_normalize(distance, COSINE_LOW, COSINE_HIGH),
                method: DistanceMethod::Cosine,
            }
        }
        DistanceMethod::Euclidean => {
            let distance = euclidean_distance(embedding, &profile.centroid);
            AnomalyScore {
                normalized_score: piecewise_normalize(distance, EUCLIDEAN_LOW, EUCLIDEAN_HIGH),
                method: DistanceMethod::Euclidean,
            }
        }
    }
}

/// Sharded, per-user profile store. One `tokio::sync::Mutex` per user, held
/// across read-then-update, per §4.3 "update discipline" / §5 shared-resource
/// policy.
#[derive(Default)]
pub struct ProfileStore {
    profiles: Mutex<FxHashMap<String, Arc<Mutex<BehavioralProfile>>>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn profile_lock(&self, user_id: &str) -> Arc<Mutex<BehavioralProfile>> {
        let mut profiles = self.profiles.lock().await;
        profiles
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BehavioralProfile::empty())))
            .clone()
    }
}

pub struct BehaviorEvaluator {
    mutate_on_score: bool,
    preferred_method: DistanceMethod,
    min_sessions: usize,
}

impl BehaviorEvaluator {
    pub fn new(mutate_on_score: bool, min_sessions: usize) -> Self {
        Self {
            mutate_on_score,
            preferred_method: DistanceMethod::Mahalanobis,
            min_sessions,
        }
    }

    #[tracing::instrument(skip_all, fields(user_id = %user.user_id))]
    pub async fn evaluate(
        &self,
        store: &ProfileStore,
        login_event: &LoginEvent,
        session: &Session,
        user: &User,
        device_type: DeviceType,
    ) -> BehaviorEvaluation {
        let embedding = build_embedding(login_event, session, device_type);

        let lock = store.profile_lock(&user.user_id).await;
        let mut profile = lock.lock().await;

        if !profile.is_valid(self.min_sessions) {
            let result = BehaviorEvaluation {
                match_score: 0.90,
                deviations: vec!["new_user_no_baseline".to_string()],
            };
            if self.mutate_on_score {
                profile.update(embedding, Utc::now(), self.min_sessions);
            }
            return result;
        }

        let anomaly = compute_anomaly(&embedding, &profile, self.preferred_method);
        let deviations = identify_deviations(&embedding, &profile.centroid, anomaly.normalized_score);

        if self.mutate_on_score {
            profile.update(embedding, Utc::now(), self.min_sessions);
        }

        BehaviorEvaluation {
            match_score: 1.0 - anomaly.normalized_score,
            deviations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AuthMethod, GeoLocation};

    fn sample_login(time_since: Option<f64>) -> (LoginEvent, Session, User) {
        let login_event = LoginEvent {
            event_id: "e".into(),
            timestamp: Utc::now(),
            success: true,
            auth_method: AuthMethod::Password,
            failed_attempts_before: 0,
            time_since_last_login_hours: time_since,
            is_new_device: false,
            is_new_ip: false,
            is_new_location: false,
            session_id: "s".into(),
            user_id: "u".into(),
        };
        let session = Session {
            session_id: "s".into(),
            device_id: "d".into(),
            ip_address: "1.2.3.4".into(),
            geo_location: GeoLocation {
                city: "x".into(),
                country: "US".into(),
                latitude: 30.0,
                longitude: -97.0,
            },
            start_time: Utc::now(),
            is_vpn: false,
            is_tor: false,
        };
        let user = User {
            user_id: "u".into(),
            account_age_days: 10,
            home_country: "US".into(),
            home_city: "x".into(),
            typical_login_hour_start: 8,
            typical_login_hour_end: 20,
        };
        (login_event, session, user)
    }

    #[tokio::test]
    async fn new_user_gets_benefit_of_the_doubt() {
        let store = ProfileStore::new();
        let evaluator = BehaviorEvaluator::new(true, DEFAULT_MIN_SESSIONS_FOR_PROFILE);
        let (login_event, session, user) = sample_login(Some(1.0));
        let result = evaluator
            .evaluate(&store, &login_event, &session, &user, DeviceType::Desktop)
            .await;
        assert_eq!(result.match_score, 0.90);
        assert_eq!(result.deviations, vec!["new_user_no_baseline".to_string()]);
    }

    #[tokio::test]
    async fn profile_becomes_valid_after_min_sessions() {
        let store = ProfileStore::new();
        let evaluator = BehaviorEvaluator::new(true, DEFAULT_MIN_SESSIONS_FOR_PROFILE);
        let (login_event, session, user) = sample_login(Some(1.0));
        for _ in 0..DEFAULT_MIN_SESSIONS_FOR_PROFILE {
            evaluator
                .evaluate(&store, &login_event, &session, &user, DeviceType::Desktop)
                .await;
        }
        let result = evaluator
            .evaluate(&store, &login_event, &session, &user, DeviceType::Desktop)
            .await;
        // Same session pattern repeated -> low anomaly, no benefit-of-doubt tag.
        assert_ne!(result.deviations, vec!["new_user_no_baseline".to_string()]);
    }

    #[test]
    fn identity_matrix_inverts_to_itself() {
        let m = identity(4);
        let inv = invert(&m).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((inv[i][j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn cosine_normalization_is_monotonic() {
        let low = piecewise_normalize(0.05, COSINE_LOW, COSINE_HIGH);
        let mid = piecewise_normalize(0.3, COSINE_LOW, COSINE_HIGH);
        let high = piecewise_normalize(0.9, COSINE_LOW, COSINE_HIGH);
        assert!(low < mid);
        assert!(mid < high);
        assert_eq!(high, 1.0);
    }
}
