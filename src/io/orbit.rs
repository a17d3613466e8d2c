use crate::types::{InsarError, InsarResult, OrbitData, StateVector};
use chrono::{DateTime, Duration, Utc};

/// WGS84 semi-major axis (m)
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 first eccentricity squared
const WGS84_E2: f64 = 0.00669437999014;

/// Orbit state interpolation and zero-Doppler geometry
pub struct OrbitReader;

impl OrbitReader {
    fn seconds_since(orbit: &OrbitData, time: DateTime<Utc>) -> f64 {
        (time - orbit.reference_time).num_microseconds().unwrap_or(0) as f64 * 1e-6
    }

    fn time_at(orbit: &OrbitData, seconds: f64) -> DateTime<Utc> {
        orbit.reference_time + Duration::microseconds((seconds * 1e6).round() as i64)
    }

    /// Interpolate position and velocity at `time` with cubic Hermite
    /// interpolation between the bracketing state vectors.
    pub fn interpolate_state(orbit: &OrbitData, time: DateTime<Utc>) -> InsarResult<StateVector> {
        let svs = &orbit.state_vectors;
        let first = svs.first().ok_or_else(|| {
            InsarError::Processing("No state vectors in orbit data".to_string())
        })?;
        if svs.len() == 1 {
            // Propagate linearly from the only vector available
            let dt = (time - first.time).num_microseconds().unwrap_or(0) as f64 * 1e-6;
            let position = [
                first.position[0] + dt * first.velocity[0],
                first.position[1] + dt * first.velocity[1],
                first.position[2] + dt * first.velocity[2],
            ];
            return Ok(StateVector { time, position, velocity: first.velocity });
        }

        let t = Self::seconds_since(orbit, time);
        let index = match svs
            .windows(2)
            .position(|w| Self::seconds_since(orbit, w[1].time) >= t)
        {
            Some(i) => i,
            None => svs.len() - 2,
        };
        let sv1 = &svs[index];
        let sv2 = &svs[index + 1];

        let t1 = Self::seconds_since(orbit, sv1.time);
        let h = Self::seconds_since(orbit, sv2.time) - t1;
        if h <= 0.0 {
            return Err(InsarError::Processing(
                "Orbit state vectors are not strictly increasing in time".to_string(),
            ));
        }
        let s = (t - t1) / h;

        let h00 = 2.0 * s.powi(3) - 3.0 * s.powi(2) + 1.0;
        let h10 = s.powi(3) - 2.0 * s.powi(2) + s;
        let h01 = -2.0 * s.powi(3) + 3.0 * s.powi(2);
        let h11 = s.powi(3) - s.powi(2);

        let dh00 = (6.0 * s.powi(2) - 6.0 * s) / h;
        let dh10 = 3.0 * s.powi(2) - 4.0 * s + 1.0;
        let dh01 = (-6.0 * s.powi(2) + 6.0 * s) / h;
        let dh11 = 3.0 * s.powi(2) - 2.0 * s;

        let mut position = [0.0; 3];
        let mut velocity = [0.0; 3];
        for k in 0..3 {
            position[k] = h00 * sv1.position[k]
                + h10 * h * sv1.velocity[k]
                + h01 * sv2.position[k]
                + h11 * h * sv2.velocity[k];
            velocity[k] = dh00 * sv1.position[k]
                + dh10 * sv1.velocity[k]
                + dh01 * sv2.position[k]
                + dh11 * sv2.velocity[k];
        }

        Ok(StateVector { time, position, velocity })
    }

    /// Interpolate orbit position at specific time
    pub fn interpolate_position(orbit: &OrbitData, time: DateTime<Utc>) -> InsarResult<[f64; 3]> {
        Ok(Self::interpolate_state(orbit, time)?.position)
    }

    /// Find the zero-Doppler time for a ground point (ECEF): the instant the
    /// line of sight is perpendicular to the satellite velocity.
    pub fn zero_doppler_time(orbit: &OrbitData, target: &[f64; 3]) -> InsarResult<DateTime<Utc>> {
        let (first, last) = match (orbit.state_vectors.first(), orbit.state_vectors.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(InsarError::Processing(
                    "No state vectors in orbit data".to_string(),
                ))
            }
        };

        let doppler = |seconds: f64| -> InsarResult<f64> {
            let sv = Self::interpolate_state(orbit, Self::time_at(orbit, seconds))?;
            let los = [
                target[0] - sv.position[0],
                target[1] - sv.position[1],
                target[2] - sv.position[2],
            ];
            Ok(los[0] * sv.velocity[0] + los[1] * sv.velocity[1] + los[2] * sv.velocity[2])
        };

        let mut lo = Self::seconds_since(orbit, first.time);
        let mut hi = Self::seconds_since(orbit, last.time);
        if hi <= lo {
            // Single vector: widen the search window around it
            lo -= 60.0;
            hi += 60.0;
        }
        let mut f_lo = doppler(lo)?;
        let f_hi = doppler(hi)?;
        if f_lo.signum() == f_hi.signum() {
            return Err(InsarError::Processing(
                "Target is not observed within the orbit time span".to_string(),
            ));
        }

        // Bisection to sub-microsecond precision
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            let f_mid = doppler(mid)?;
            if f_mid.signum() == f_lo.signum() {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-7 {
                break;
            }
        }

        Ok(Self::time_at(orbit, 0.5 * (lo + hi)))
    }

    /// Convert lat/lon/elevation to ECEF coordinates
    pub fn latlon_to_ecef(lat: f64, lon: f64, elevation: f64) -> [f64; 3] {
        let lat_rad = lat.to_radians();
        let lon_rad = lon.to_radians();

        let n = WGS84_A / (1.0 - WGS84_E2 * lat_rad.sin().powi(2)).sqrt();

        let x = (n + elevation) * lat_rad.cos() * lon_rad.cos();
        let y = (n + elevation) * lat_rad.cos() * lon_rad.sin();
        let z = (n * (1.0 - WGS84_E2) + elevation) * lat_rad.sin();

        [x, y, z]
    }

    pub fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }
}
