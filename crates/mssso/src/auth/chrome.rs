//! [`AuthPage`] on top of a `headless_chrome` tab.

use super::page::{AuthPage, Control, Field, PageProbe};
use crate::cookies::BrowserCookie;
use crate::utils::js_escape;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::Tab;
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

const USERNAME_SELECTORS: &[&str] = &[
    "input[name=\"loginfmt\"]",
    "#i0116",
    "#userNameInput",
    "input[name=\"UserName\"]",
    "input[type=\"email\"]",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "input[name=\"passwd\"]",
    "#i0118",
    "#passwordInput",
    "input[name=\"password\"]",
    "input[type=\"password\"]",
];

const TOTP_SELECTORS: &[&str] = &[
    "#idTxtBx_SAOTCC_OTC",
    "input[name=\"otc\"]",
    "input[autocomplete=\"one-time-code\"]",
    "input[placeholder*=\"code\" i]",
];

/// Shared JS helpers prepended to every probe and action script.
const JS_PRELUDE: &str = r#"
function __vis(el) { return !!(el && el.offsetParent !== null); }
function __first(sels) {
    for (var i = 0; i < sels.length; i++) {
        var els = document.querySelectorAll(sels[i]);
        for (var j = 0; j < els.length; j++) { if (__vis(els[j])) return els[j]; }
    }
    return null;
}
function __byText(texts) {
    var els = document.querySelectorAll('a, button, input[type="button"], input[type="submit"], div[role="button"], div[role="link"], [data-value]');
    for (var i = 0; i < els.length; i++) {
        if (!__vis(els[i])) continue;
        var t = ((els[i].innerText || els[i].value || '') + '').trim().toLowerCase();
        for (var k = 0; k < texts.length; k++) { if (t.indexOf(texts[k]) !== -1) return els[i]; }
    }
    return null;
}
function __bodyHas(texts) {
    var b = document.body ? document.body.innerText.toLowerCase() : '';
    for (var k = 0; k < texts.length; k++) { if (b.indexOf(texts[k]) !== -1) return true; }
    return false;
}
function __click(el) { if (el) { el.focus(); el.click(); return true; } return false; }
"#;

const PROBE_JS: &str = r#"
(function(user) {
    var header = document.getElementById('loginHeader');
    var headerText = header ? header.innerText.trim().toLowerCase() : '';
    var tiles = document.querySelectorAll('#tilesHolder .table[role="button"], #tilesHolder .tile[role="listitem"], [data-test-id]');
    var picker = headerText === 'pick an account' || (tiles.length > 0 && !!document.getElementById('otherTile'));
    var matching = false;
    if (picker && user) {
        for (var i = 0; i < tiles.length; i++) {
            var t = ((tiles[i].innerText || '') + ' ' + (tiles[i].getAttribute('data-test-id') || '')).toLowerCase();
            if (t.indexOf(user) !== -1) { matching = true; break; }
        }
    }

    var userEl = __first(USERNAME);
    var passEl = __first(PASSWORD);
    var adfs = __vis(document.getElementById('userNameInput')) && __vis(document.getElementById('passwordInput'));

    var pushTitle = document.getElementById('idDiv_SAOTCAS_Title');
    var numberEl = document.getElementById('idRichContext_DisplaySign') || document.getElementById('idRemoteNGC_DisplaySign');
    var push = __vis(numberEl) || (__vis(pushTitle) && pushTitle.innerText.toLowerCase().indexOf('approve sign in request') !== -1);

    var proofTitle = document.getElementById('idDiv_SAOTCS_Title');
    var verify = (__vis(proofTitle) && proofTitle.innerText.toLowerCase().indexOf('verify your identity') !== -1)
        || !!document.querySelector('div[data-value="PhoneAppOTP"], div[data-value="PhoneAppNotification"]');
    var appCode = !!document.querySelector('div[data-value="PhoneAppOTP"]') || !!__byText(['use a verification code']);

    var kmsiBtn = document.getElementById('idSIButton9');
    var kmsi = !!document.getElementById('KmsiCheckboxField')
        || headerText === 'stay signed in?'
        || (__vis(kmsiBtn) && kmsiBtn.value === 'Yes' && headerText.indexOf('stay signed in') !== -1);

    var errorText = null;
    var errIds = ['usernameError', 'passwordError', 'idSpan_SAOTCC_Error_OTC', 'errorText', 'idTD_Error', 'error'];
    for (var e = 0; e < errIds.length; e++) {
        var el = document.getElementById(errIds[e]);
        if (__vis(el) && el.innerText.trim().length > 0) { errorText = el.innerText.trim(); break; }
    }
    var transient = __bodyHas(['an error occurred', 'authentication attempt failed']);
    if (!errorText && transient) {
        errorText = __bodyHas(['an error occurred']) ? 'An error occurred' : 'Authentication attempt failed';
    }

    return JSON.stringify({
        accountPicker: picker,
        matchingTile: matching,
        usernameField: !!userEl,
        passwordField: !!passEl,
        adfsForm: adfs,
        usePasswordLink: __vis(document.getElementById('idA_PWD_SwitchToPassword')) || !!__byText(['use your password instead', 'password instead']),
        totpField: !!__first(TOTP),
        otherWayLink: __vis(document.getElementById('signInAnotherWay')) || __vis(document.getElementById('idA_SAASTO_LookupLink'))
            || !!__byText(['sign in another way', 'use a different verification option', "i can't use my microsoft authenticator app right now"]),
        verificationOptions: verify,
        appCodeOption: appCode,
        pushPrompt: push,
        pushNumber: __vis(numberEl) ? numberEl.innerText.trim() : null,
        staySignedIn: kmsi,
        errorText: errorText,
        transientError: transient
    });
})('USER')
"#;

fn js_array(items: &[&str]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| format!("'{}'", js_escape(s)))
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Thin wrapper around a Chrome tab hosting the JS probes and actions.
pub struct ChromePage {
    tab: Arc<Tab>,
    /// Lowercased username, used to recognise the matching account tile.
    username: String,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>, username: &str) -> Self {
        Self {
            tab,
            username: username.to_lowercase(),
        }
    }

    // ── Low-level JS evaluation helpers ──────────────────────────────────

    /// Evaluates JS and returns the boolean result.
    /// Returns `false` if the script returns null/undefined.
    fn eval_bool(&self, js: &str) -> anyhow::Result<bool> {
        Ok(self
            .tab
            .evaluate(&format!("{}\n{}", JS_PRELUDE, js), false)?
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Evaluates JS and returns the string result, or `None` if null/undefined.
    fn eval_string(&self, js: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .tab
            .evaluate(&format!("{}\n{}", JS_PRELUDE, js), false)?
            .value
            .and_then(|v| v.as_str().map(|s| s.to_string())))
    }

    /// Fills the first visible input matching `selectors` and dispatches input/change events.
    fn fill_input_value(&self, selectors: &[&str], value: &str) -> anyhow::Result<bool> {
        let val = js_escape(value);
        let js = format!(
            r#"(function() {{
    var el = __first({sels});
    if (!el) return false;
    el.focus();
    el.value = '{val}';
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}})()"#,
            sels = js_array(selectors)
        );
        self.eval_bool(&js)
    }

    fn click_first(&self, ids: &[&str], texts: &[&str]) -> anyhow::Result<bool> {
        let js = format!(
            "(function() {{ return __click(__first({}) || __byText({})); }})()",
            js_array(ids),
            js_array(texts)
        );
        self.eval_bool(&js)
    }

    /// Clicks the form's submit button, or submits the form holding the focused input.
    fn submit(&self) -> anyhow::Result<bool> {
        if self.click_first(
            &["#idSIButton9", "#submitButton", "input[type=\"submit\"]", "button[type=\"submit\"]"],
            &[],
        )? {
            return Ok(true);
        }
        let submitted = self.eval_bool(
            r#"(function() {
    var el = document.activeElement;
    if (el && el.form) { if (el.form.requestSubmit) { el.form.requestSubmit(); } else { el.form.submit(); } return true; }
    return false;
})()"#,
        )?;
        if !submitted {
            self.tab.press_key("Enter")?;
        }
        Ok(true)
    }
}

impl AuthPage for ChromePage {
    fn navigate(&self, url: &str) -> anyhow::Result<()> {
        self.tab.navigate_to(url)?;
        if let Err(e) = self.tab.wait_until_navigated() {
            log::warn!("[!] Navigation wait timed out: {}, continuing...", e);
        }
        Ok(())
    }

    fn current_url(&self) -> String {
        self.tab.get_url()
    }

    fn probe(&self) -> anyhow::Result<PageProbe> {
        let js = PROBE_JS
            .replace("USERNAME", &js_array(USERNAME_SELECTORS))
            .replace("PASSWORD", &js_array(PASSWORD_SELECTORS))
            .replace("TOTP", &js_array(TOTP_SELECTORS))
            .replace("'USER'", &format!("'{}'", js_escape(&self.username)));
        match self.eval_string(&js)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            // Page between documents; nothing to see yet.
            None => Ok(PageProbe::default()),
        }
    }

    fn fill(&self, field: Field, value: &str) -> anyhow::Result<()> {
        let selectors = match field {
            Field::Username => USERNAME_SELECTORS,
            Field::Password => PASSWORD_SELECTORS,
            Field::Totp => TOTP_SELECTORS,
        };
        if !self.fill_input_value(selectors, value)? {
            log::debug!("No visible {:?} field to fill", field);
        }
        sleep(Duration::from_millis(250));
        Ok(())
    }

    fn click(&self, control: Control) -> anyhow::Result<bool> {
        let clicked = match control {
            Control::MatchingAccount => {
                let user = js_escape(&self.username);
                self.eval_bool(&format!(
                    r#"(function() {{
    var tiles = document.querySelectorAll('#tilesHolder .table[role="button"], #tilesHolder .tile[role="listitem"], [data-test-id]');
    for (var i = 0; i < tiles.length; i++) {{
        var t = ((tiles[i].innerText || '') + ' ' + (tiles[i].getAttribute('data-test-id') || '')).toLowerCase();
        if (t.indexOf('{user}') !== -1 && __vis(tiles[i])) return __click(tiles[i]);
    }}
    return false;
}})()"#
                ))?
            }
            Control::OtherAccount => self.click_first(
                &["#otherTile", "#otherTileText"],
                &["use another account", "sign in with another account", "use a different account"],
            )?,
            Control::Submit => self.submit()?,
            Control::UsePassword => self.click_first(
                &["#idA_PWD_SwitchToPassword"],
                &["use your password instead", "password instead"],
            )?,
            Control::OtherWay => self.click_first(
                &["#signInAnotherWay", "#idA_SAASTO_LookupLink"],
                &[
                    "sign in another way",
                    "use a different verification option",
                    "i can't use my microsoft authenticator app right now",
                ],
            )?,
            Control::AppCode => self.click_first(
                &["div[data-value=\"PhoneAppOTP\"]"],
                &["use a verification code", "verification code"],
            )?,
            Control::AppNotification => self.click_first(
                &["div[data-value=\"PhoneAppNotification\"]"],
                &["approve a request", "mobile app", "authenticator"],
            )?,
            Control::TotpSubmit => {
                self.click_first(&["#idSubmit_SAOTCC_Continue"], &["verify"])? || self.submit()?
            }
            Control::StaySignedIn => {
                self.eval_bool(
                    "(function(){ var c=document.querySelector('#KmsiCheckboxField'); if(c && !c.checked){c.click();} return true; })()",
                )?;
                self.click_first(&["#idSIButton9"], &["yes"])?
            }
        };
        sleep(Duration::from_millis(400));
        Ok(clicked)
    }

    fn reload(&self) -> anyhow::Result<()> {
        self.tab.reload(false, None)?;
        if let Err(e) = self.tab.wait_until_navigated() {
            log::warn!("[!] Reload wait timed out: {}, continuing...", e);
        }
        Ok(())
    }

    fn cookies(&self) -> anyhow::Result<Vec<BrowserCookie>> {
        let cookies = self
            .tab
            .get_cookies()
            .map_err(|e| anyhow::anyhow!("Browser error: {}", e))?;
        Ok(cookies
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
            })
            .collect())
    }

    fn page_source(&self) -> anyhow::Result<String> {
        Ok(self.tab.get_content()?)
    }

    fn screenshot(&self, path: &Path) -> anyhow::Result<()> {
        let png = self
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
        std::fs::write(path, png)?;
        Ok(())
    }
}
