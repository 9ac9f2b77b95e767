//! A `Driver` implementation that speaks the `MockTransport` SCPI-ish dialect.
//! Used both in tests and as the built-in simulated instrument for development.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;
use crate::model::{Capabilities, DeviceInfo, DeviceType, MeasurementDescriptor, SetpointDescriptor};
use crate::transport::Transport;

use super::{Driver, DriverStatus};

pub struct MockDriver<T: Transport> {
    transport: T,
    info: DeviceInfo,
    capabilities: Capabilities,
    timeout: Duration,
}

impl<T: Transport> MockDriver<T> {
    /// Builds a driver fronting a two-quadrant power supply: `CV`/`CC` modes,
    /// a `voltage` and `current` setpoint, matching measurement channels.
    pub fn power_supply(transport: T, device_id: impl Into<String>) -> Self {
        let capabilities = Capabilities {
            modes: vec!["CV".into(), "CC".into()],
            modes_settable: true,
            outputs: vec![
                SetpointDescriptor {
                    name: "voltage".into(),
                    unit: "V".into(),
                    min: 0.0,
                    max: 30.0,
                    decimals: 3,
                    modes: None,
                },
                SetpointDescriptor {
                    name: "current".into(),
                    unit: "A".into(),
                    min: 0.0,
                    max: 5.0,
                    decimals: 3,
                    modes: None,
                },
            ],
            measurements: vec![
                MeasurementDescriptor {
                    name: "voltage".into(),
                    unit: "V".into(),
                    decimals: 3,
                },
                MeasurementDescriptor {
                    name: "current".into(),
                    unit: "A".into(),
                    decimals: 3,
                },
            ],
            features: vec![],
            channels: vec![],
        };
        Self {
            transport,
            info: DeviceInfo {
                id: device_id.into(),
                manufacturer: "Simulated".into(),
                model: "PSU-100".into(),
                serial: None,
                device_type: DeviceType::PowerSupply,
            },
            capabilities,
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl<T: Transport> Driver for MockDriver<T> {
    async fn describe(&mut self) -> AppResult<(DeviceInfo, Capabilities)> {
        Ok((self.info.clone(), self.capabilities.clone()))
    }

    async fn read_status(&mut self) -> AppResult<DriverStatus> {
        let mode = self.transport.send("MODE?", self.timeout).await?;
        let output = self.transport.send("OUTP?", self.timeout).await?;
        let mut setpoints = std::collections::HashMap::new();
        let mut measurements = std::collections::HashMap::new();
        for output_desc in &self.capabilities.outputs {
            let query = format!("SOUR:{}?", output_desc.name);
            let value: f64 = self
                .transport
                .send(&query, self.timeout)
                .await?
                .parse()
                .unwrap_or(0.0);
            setpoints.insert(output_desc.name.clone(), value);
        }
        for meas_desc in &self.capabilities.measurements {
            let query = format!("MEAS:{}?", meas_desc.name);
            let value: f64 = self
                .transport
                .send(&query, self.timeout)
                .await?
                .parse()
                .unwrap_or(0.0);
            measurements.insert(meas_desc.name.clone(), value);
        }
        Ok(DriverStatus {
            mode: Some(mode),
            output_enabled: output.trim() == "1",
            setpoints,
            measurements,
        })
    }

    async fn set_mode(&mut self, mode: &str) -> AppResult<()> {
        self.transport
            .send(&format!("MODE {mode}"), self.timeout)
            .await?;
        Ok(())
    }

    async fn set_output(&mut self, enabled: bool) -> AppResult<()> {
        let value = if enabled { "1" } else { "0" };
        self.transport
            .send(&format!("OUTP {value}"), self.timeout)
            .await?;
        Ok(())
    }

    async fn set_value(&mut self, name: &str, value: f64) -> AppResult<()> {
        self.transport
            .send(&format!("SOUR:{name} {value}"), self.timeout)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn driver() -> MockDriver<MockTransport> {
        let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into(), "CC".into()])
            .with_setpoint("voltage", 0.0)
            .with_setpoint("current", 0.0);
        MockDriver::power_supply(transport, "psu-1")
    }

    #[tokio::test]
    async fn test_set_and_read_value() {
        let mut d = driver();
        d.set_value("voltage", 5.0).await.unwrap();
        let status = d.read_status().await.unwrap();
        assert_eq!(status.setpoints["voltage"], 5.0);
    }

    #[tokio::test]
    async fn test_set_mode_round_trips() {
        let mut d = driver();
        d.set_mode("CC").await.unwrap();
        let status = d.read_status().await.unwrap();
        assert_eq!(status.mode.as_deref(), Some("CC"));
    }

    #[tokio::test]
    async fn test_describe_returns_static_capabilities() {
        let mut d = driver();
        let (info, caps) = d.describe().await.unwrap();
        assert_eq!(info.id, "psu-1");
        assert!(caps.has_output("voltage"));
    }
}
