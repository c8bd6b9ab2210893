use crate::error::PortError;
use crate::persistence::{newest_first, Page, RideHistory};
use crate::types::{DriverId, PassengerId, Ride};

use super::DispatchStore;

impl DispatchStore {
    fn rides_where(&self, keep: impl Fn(&Ride) -> bool) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self
            .read()
            .rides
            .values()
            .filter(|&ride| keep(ride))
            .cloned()
            .collect();
        newest_first(&mut rides);
        rides
    }
}

/// History over the rides held in memory, live and finished alike.
impl RideHistory for DispatchStore {
    fn list_by_passenger(
        &self,
        passenger: &PassengerId,
        page: Page,
    ) -> Result<Vec<Ride>, PortError> {
        Ok(page.apply(self.rides_where(|ride| &ride.passenger_id == passenger)))
    }

    fn count_by_passenger(&self, passenger: &PassengerId) -> Result<usize, PortError> {
        Ok(self
            .read()
            .rides
            .values()
            .filter(|ride| &ride.passenger_id == passenger)
            .count())
    }

    fn list_by_driver(&self, driver: &DriverId, page: Page) -> Result<Vec<Ride>, PortError> {
        Ok(page.apply(self.rides_where(|ride| ride.is_assigned_to(driver))))
    }

    fn count_by_driver(&self, driver: &DriverId) -> Result<usize, PortError> {
        Ok(self
            .read()
            .rides
            .values()
            .filter(|ride| ride.is_assigned_to(driver))
            .count())
    }
}
