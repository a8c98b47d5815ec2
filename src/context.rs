//! The immutable per-request case file (§3).
//!
//! `InputContext` and its constituents are created once per request and
//! never mutated; they flow by value through the router, the evaluators,
//! and the decision flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DecisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    Mfa,
    Sso,
    Biometric,
}

impl AuthMethod {
    /// One-hot index matching the feature-vector order in §4.2.
    pub fn one_hot_index(self) -> usize {
        match self {
            AuthMethod::Password => 0,
            AuthMethod::Mfa => 1,
            AuthMethod::Sso => 2,
            AuthMethod::Biometric => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn one_hot_index(self) -> usize {
        match self {
            DeviceType::Desktop => 0,
            DeviceType::Mobile => 1,
            DeviceType::Tablet => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub auth_method: AuthMethod,
    pub failed_attempts_before: u32,
    pub time_since_last_login_hours: Option<f64>,
    pub is_new_device: bool,
    pub is_new_ip: bool,
    pub is_new_location: bool,
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub ip_address: String,
    pub geo_location: GeoLocation,
    pub start_time: DateTime<Utc>,
    pub is_vpn: bool,
    pub is_tor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: DeviceType,
    pub os: String,
    pub browser: String,
    pub is_known: bool,
    pub first_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub account_age_days: u32,
    pub home_country: String,
    pub home_city: String,
    pub typical_login_hour_start: u8,
    pub typical_login_hour_end: u8,
}

impl User {
    /// Whether `hour` falls within the user's typical login window,
    /// inclusive of both endpoints, handling overnight wraparound
    /// (`end < start`) per §8 boundary rules.
    pub fn hour_in_typical_window(&self, hour: u8) -> bool {
        let (start, end) = (self.typical_login_hour_start, self.typical_login_hour_end);
        if start <= end {
            hour >= start && hour <= end
        } else {
            hour >= start || hour <= end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    pub login_event: LoginEvent,
    pub session: Session,
    pub device: Device,
    pub user: User,
}

impl InputContext {
    /// Validates the cross-field invariants named in §3. Called once at the
    /// transport boundary; the core never re-derives them downstream.
    pub fn validate(&self) -> Result<(), DecisionError> {
        if self.login_event.session_id != self.session.session_id {
            return Err(DecisionError::Validation(format!(
                "login_event.session_id ({}) does not match session.session_id ({})",
                self.login_event.session_id, self.session.session_id
            )));
        }
        if self.login_event.user_id != self.user.user_id {
            return Err(DecisionError::Validation(format!(
                "login_event.user_id ({}) does not match user.user_id ({})",
                self.login_event.user_id, self.user.user_id
            )));
        }
        if self.session.device_id != self.device.device_id {
            return Err(DecisionError::Validation(format!(
                "session.device_id ({}) does not match device.device_id ({})",
                self.session.device_id, self.device.device_id
            )));
        }
        if !(-90.0..=90.0).contains(&self.session.geo_location.latitude) {
            return Err(DecisionError::Validation(
                "geo_location.latitude out of range".into(),
            ));
        }
        if !(-180.0..=180.0).contains(&self.session.geo_location.longitude) {
            return Err(DecisionError::Validation(
                "geo_location.longitude out of range".into(),
            ));
        }
        if self.user.typical_login_hour_start > 23 || self.user.typical_login_hour_end > 23 {
            return Err(DecisionError::Validation(
                "typical login hour must be in 0..=23".into(),
            ));
        }
        Ok(())
    }
}
