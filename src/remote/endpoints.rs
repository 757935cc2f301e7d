// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::{ParseError, Url};

use crate::config::ServerFlavor;
use crate::error::TransportError;

const NEXTCLOUD_APP: [&str; 3] = ["index.php", "apps", "gpoddersync"];

/// URL builder for one server; knows the API v2 and Nextcloud layouts
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
    login: String,
    flavor: ServerFlavor,
}

impl Endpoints {
    pub fn new(base: Url, login: &str, flavor: ServerFlavor) -> Self {
        Self {
            base,
            login: login.to_string(),
            flavor,
        }
    }

    pub fn flavor(&self) -> ServerFlavor {
        self.flavor
    }

    /// `POST /api/2/auth/{login}/login.json`
    pub fn login(&self) -> Result<Option<Url>, TransportError> {
        if !self.flavor.supports_session_login() {
            return Ok(None);
        }
        self.api(&["auth", &self.login, "login.json"]).map(Some)
    }

    /// `GET /api/2/devices/{login}.json`
    pub fn devices(&self) -> Result<Option<Url>, TransportError> {
        if self.flavor == ServerFlavor::Nextcloud {
            return Ok(None);
        }
        let file = json_file(&self.login);
        self.api(&["devices", &file]).map(Some)
    }

    /// `POST /api/2/devices/{login}/{device}.json`
    pub fn device(&self, device: &str) -> Result<Option<Url>, TransportError> {
        if self.flavor == ServerFlavor::Nextcloud {
            return Ok(None);
        }
        let file = json_file(device);
        self.api(&["devices", &self.login, &file]).map(Some)
    }

    /// Subscription changes since `since`
    pub fn subscriptions(&self, device: &str, since: i64) -> Result<Url, TransportError> {
        let mut url = match self.flavor {
            ServerFlavor::Nextcloud => self.nextcloud(&["subscriptions"])?,
            _ => {
                let file = json_file(device);
                self.api(&["subscriptions", &self.login, &file])?
            }
        };
        url.query_pairs_mut().append_pair("since", &since.to_string());
        Ok(url)
    }

    /// Full-list overwrite target; Nextcloud has none
    pub fn subscriptions_overwrite(&self, device: &str) -> Result<Option<Url>, TransportError> {
        if self.flavor == ServerFlavor::Nextcloud {
            return Ok(None);
        }
        let file = json_file(device);
        self.api(&["subscriptions", &self.login, &file]).map(Some)
    }

    /// Delta upload target
    pub fn subscription_changes(&self, device: &str) -> Result<Url, TransportError> {
        match self.flavor {
            ServerFlavor::Nextcloud => self.nextcloud(&["subscription_change", "create"]),
            _ => {
                let file = json_file(device);
                self.api(&["subscriptions", &self.login, &file])
            }
        }
    }

    /// Episode actions since `since`
    pub fn episode_actions(&self, device: &str, since: i64) -> Result<Url, TransportError> {
        let mut url = match self.flavor {
            ServerFlavor::Nextcloud => self.nextcloud(&["episode_action"])?,
            _ => {
                let file = json_file(&self.login);
                self.api(&["episodes", &file])?
            }
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("since", &since.to_string());
            if self.flavor != ServerFlavor::Nextcloud {
                query.append_pair("device", device);
            }
        }
        Ok(url)
    }

    pub fn upload_episode_actions(&self) -> Result<Url, TransportError> {
        match self.flavor {
            ServerFlavor::Nextcloud => self.nextcloud(&["episode_action", "create"]),
            _ => {
                let file = json_file(&self.login);
                self.api(&["episodes", &file])
            }
        }
    }

    fn api(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut path = vec!["api", "2"];
        path.extend_from_slice(segments);
        self.join(&path)
    }

    fn nextcloud(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut path = NEXTCLOUD_APP.to_vec();
        path.extend_from_slice(segments);
        self.join(&path)
    }

    fn join(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(ParseError::RelativeUrlWithoutBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn json_file(name: &str) -> String {
    format!("{name}.json")
}
