use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::browser::{BrowserAutomation, BrowserError, BrowserResult, ControlRef, FieldRef};
use crate::form::{ButtonDescriptor, FieldDescriptor, FieldKind, FormStepSnapshot};
use crate::models::FieldType;

const REF_ATTR: &str = "data-autoapply-ref";

/// Collects visible fields and buttons of the active dialog (or the page when
/// no dialog is open), tagging each with a stable ref attribute.
const SNAPSHOT_SCRIPT: &str = r#"
const ATTR = 'data-autoapply-ref';
window.__autoapplySeq = window.__autoapplySeq || 0;
const tag = (el, prefix) => {
  if (!el.getAttribute(ATTR)) { el.setAttribute(ATTR, prefix + (++window.__autoapplySeq)); }
  return el.getAttribute(ATTR);
};
const visible = el => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
const text = el => (el ? (el.innerText || el.textContent || '').trim().replace(/\s+/g, ' ') : '');
const dialogs = Array.from(document.querySelectorAll('[role="dialog"]')).filter(visible);
const root = dialogs.length ? dialogs[dialogs.length - 1] : document.body;

const labelFor = el => {
  if (el.id) {
    const label = root.querySelector('label[for="' + CSS.escape(el.id) + '"]');
    if (label && text(label)) return text(label);
  }
  const legend = el.closest('fieldset') && el.closest('fieldset').querySelector('legend');
  if (el.type === 'radio' && legend) return text(legend);
  const wrapping = el.closest('label');
  if (wrapping && text(wrapping)) return text(wrapping);
  return el.getAttribute('aria-label') || el.getAttribute('placeholder') || el.name || '';
};
const errorFor = el => {
  const ids = (el.getAttribute('aria-describedby') || '').split(/\s+/).filter(Boolean);
  for (const id of ids) {
    const node = document.getElementById(id);
    if (node && /error|invalid|required|enter|please/i.test(text(node))) return text(node);
  }
  const box = el.closest('.fb-dash-form-element, .form-group, fieldset, div');
  const alert = box && box.querySelector('[role="alert"], [class*="error"]');
  return alert && text(alert) ? text(alert) : null;
};
const required = el => el.required || el.getAttribute('aria-required') === 'true';

const fields = [];
const seenRadios = new Set();
for (const el of root.querySelectorAll('input, textarea, select')) {
  const type = (el.getAttribute('type') || el.tagName).toLowerCase();
  if (['hidden', 'submit', 'button'].includes(type)) continue;
  if (type !== 'file' && !visible(el)) continue;
  if (type === 'radio') {
    if (seenRadios.has(el.name)) continue;
    seenRadios.add(el.name);
    const group = Array.from(root.querySelectorAll('input[type="radio"]')).filter(r => r.name === el.name);
    const checked = group.find(r => r.checked);
    fields.push({
      refId: tag(el, 'f'), label: labelFor(el), htmlType: 'radio', kind: 'radio',
      value: checked ? text(checked.closest('label')) || checked.value : '',
      required: group.some(required), error: errorFor(el),
      options: group.map(r => {
        const label = r.id && root.querySelector('label[for="' + CSS.escape(r.id) + '"]');
        return label ? text(label) : r.value;
      }),
    });
    continue;
  }
  const kind = el.tagName === 'SELECT' ? 'select' : el.tagName === 'TEXTAREA' ? 'textarea' : type === 'checkbox' ? 'checkbox' : type === 'file' ? 'file' : 'input';
  let value = el.value || '';
  if (kind === 'select') value = el.selectedIndex >= 0 ? text(el.options[el.selectedIndex]) : '';
  if (kind === 'checkbox') value = el.checked ? 'Yes' : '';
  fields.push({
    refId: tag(el, 'f'), label: labelFor(el), htmlType: type, kind: kind, value: value,
    required: required(el), error: errorFor(el),
    options: kind === 'select' ? Array.from(el.options).map(o => text(o)) : [],
  });
}

const buttons = Array.from(root.querySelectorAll('button, [role="button"]')).filter(visible).map(b => ({
  refId: tag(b, 'b'),
  label: b.getAttribute('aria-label') || text(b),
  enabled: !b.disabled && b.getAttribute('aria-disabled') !== 'true',
}));

const errors = Array.from(root.querySelectorAll('[role="alert"]'))
  .filter(a => visible(a) && !a.closest('input, textarea, select, fieldset'))
  .map(text).filter(Boolean);

return { fields: fields, buttons: buttons, errors: errors };
"#;

/// Picks an option by its visible label and fires the events frameworks listen for.
const CHOOSE_SCRIPT: &str = r#"
const [ref, wanted] = arguments;
const el = document.querySelector('[data-autoapply-ref="' + ref + '"]');
if (!el) return 'missing';
const norm = s => (s || '').trim().replace(/\s+/g, ' ').toLowerCase();
const fire = node => ['input', 'change'].forEach(t => node.dispatchEvent(new Event(t, { bubbles: true })));
if (el.tagName === 'SELECT') {
  const option = Array.from(el.options).find(o => norm(o.textContent) === norm(wanted));
  if (!option) return 'no-option';
  el.value = option.value;
  fire(el);
  return 'ok';
}
if (el.type === 'radio') {
  const group = Array.from(document.querySelectorAll('input[type="radio"]')).filter(r => r.name === el.name);
  const match = group.find(r => {
    const label = r.id && document.querySelector('label[for="' + CSS.escape(r.id) + '"]');
    return norm(label ? label.textContent : r.value) === norm(wanted);
  });
  if (!match) return 'no-option';
  match.click();
  return 'ok';
}
if (el.type === 'checkbox') {
  const want = ['yes', 'true', 'on', 'checked'].includes(norm(wanted));
  if (el.checked !== want) el.click();
  return 'ok';
}
return 'unsupported';
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    ref_id: String,
    label: String,
    html_type: String,
    kind: String,
    value: String,
    required: bool,
    options: Vec<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawButton {
    ref_id: String,
    label: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    fields: Vec<RawField>,
    buttons: Vec<RawButton>,
    errors: Vec<String>,
}

impl From<RawSnapshot> for FormStepSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        FormStepSnapshot {
            fields: raw
                .fields
                .into_iter()
                .map(|f| FieldDescriptor {
                    field_ref: FieldRef(f.ref_id),
                    label: f.label,
                    field_type: FieldType::from_html_type(&f.html_type),
                    kind: FieldKind::parse(&f.kind),
                    value: f.value,
                    required: f.required,
                    options: f.options,
                    error: f.error.filter(|e| !e.trim().is_empty()),
                })
                .collect(),
            buttons: raw
                .buttons
                .into_iter()
                .filter(|b| !b.label.trim().is_empty())
                .map(|b| ButtonDescriptor {
                    control_ref: ControlRef(b.ref_id),
                    label: b.label,
                    enabled: b.enabled,
                })
                .collect(),
            errors: raw.errors,
        }
    }
}

/// `BrowserAutomation` over a WebDriver server (chromedriver, geckodriver).
/// The async client runs on a private runtime so callers stay synchronous.
pub struct WebDriverBrowser {
    runtime: Runtime,
    driver: WebDriver,
    screenshot_dir: PathBuf,
    call_timeout: Duration,
    settle: Duration,
    kinds: HashMap<String, FieldKind>,
}

impl WebDriverBrowser {
    pub fn connect(server_url: &str, screenshot_dir: &Path) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start browser runtime")?;

        let caps = DesiredCapabilities::chrome();
        let driver = runtime
            .block_on(WebDriver::new(server_url, caps))
            .with_context(|| format!("Failed to connect to WebDriver at {}. Is chromedriver running?", server_url))?;

        std::fs::create_dir_all(screenshot_dir)
            .with_context(|| format!("Failed to create screenshot directory {}", screenshot_dir.display()))?;

        Ok(Self {
            runtime,
            driver,
            screenshot_dir: screenshot_dir.to_path_buf(),
            call_timeout: Duration::from_secs(15),
            settle: Duration::from_millis(1500),
            kinds: HashMap::new(),
        })
    }

    pub fn quit(self) -> Result<()> {
        self.runtime
            .block_on(self.driver.quit())
            .context("Failed to close WebDriver session")
    }

    fn run<T, E, F>(&self, what: &str, fut: F) -> BrowserResult<T>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match self.runtime.block_on(tokio::time::timeout(self.call_timeout, fut)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_error(what, &e.to_string())),
            Err(_) => Err(BrowserError::Timeout(what.to_string())),
        }
    }

    fn element(&self, reference: &str) -> BrowserResult<WebElement> {
        let selector = format!("[{}=\"{}\"]", REF_ATTR, reference);
        self.run(reference, self.driver.find(By::Css(selector.as_str())))
    }

    fn settle(&self) {
        std::thread::sleep(self.settle);
    }
}

impl BrowserAutomation for WebDriverBrowser {
    fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        debug!(url, "navigating");
        self.run(url, self.driver.goto(url)).map_err(|e| match e {
            BrowserError::ElementNotFound(msg) => BrowserError::NavigationBlocked(msg),
            other => other,
        })?;
        self.settle();

        let current = self.run("current url", self.driver.current_url())?;
        let current = current.as_str().to_lowercase();
        if ["authwall", "/login", "/checkpoint", "/uas/"].iter().any(|wall| current.contains(wall)) {
            return Err(BrowserError::NavigationBlocked(format!("redirected to {}", current)));
        }
        self.kinds.clear();
        Ok(())
    }

    fn snapshot(&mut self) -> BrowserResult<FormStepSnapshot> {
        let ret = self.run("snapshot", self.driver.execute(SNAPSHOT_SCRIPT, Vec::new()))?;
        let raw: RawSnapshot = serde_json::from_value(ret.json().clone())
            .map_err(|e| BrowserError::ElementNotFound(format!("unreadable snapshot: {e}")))?;
        let snapshot = FormStepSnapshot::from(raw);

        self.kinds = snapshot
            .fields
            .iter()
            .map(|f| (f.field_ref.0.clone(), f.kind))
            .collect();
        Ok(snapshot)
    }

    fn fill(&mut self, field: &FieldRef, value: &str) -> BrowserResult<()> {
        let kind = self.kinds.get(&field.0).copied().unwrap_or(FieldKind::Input);
        match kind {
            FieldKind::Select | FieldKind::Radio | FieldKind::Checkbox => {
                let args = vec![serde_json::json!(field.0), serde_json::json!(value)];
                let ret = self.run(&field.0, self.driver.execute(CHOOSE_SCRIPT, args))?;
                match ret.json().as_str() {
                    Some("ok") => Ok(()),
                    Some("missing") => Err(BrowserError::ElementNotFound(field.0.clone())),
                    other => Err(BrowserError::ElementNotFound(format!(
                        "{}: cannot choose {:?} ({})",
                        field.0,
                        value,
                        other.unwrap_or("no result")
                    ))),
                }
            }
            FieldKind::Input | FieldKind::TextArea | FieldKind::File => {
                let element = self.element(&field.0)?;
                self.run(&field.0, element.clear())?;
                self.run(&field.0, element.send_keys(value))
            }
        }
    }

    fn click(&mut self, control: &ControlRef) -> BrowserResult<()> {
        let element = self.element(&control.0)?;
        self.run(&control.0, element.click())?;
        self.settle();
        Ok(())
    }

    fn upload(&mut self, field: &FieldRef, file: &Path) -> BrowserResult<()> {
        let element = self.element(&field.0)?;
        let path = file.to_string_lossy().to_string();
        self.run(&field.0, element.send_keys(path.as_str()))
    }

    fn screenshot(&mut self, name: &str) -> BrowserResult<String> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self.screenshot_dir.join(format!("{}-{}.png", name, stamp));
        self.run("screenshot", self.driver.screenshot(&path))?;
        Ok(path.display().to_string())
    }
}

/// Classifies a WebDriver failure by its message; the protocol's error codes
/// all surface in the text.
fn map_error(what: &str, message: &str) -> BrowserError {
    let lower = message.to_lowercase();
    let detail = format!("{}: {}", what, message);
    if lower.contains("invalid session")
        || lower.contains("no such window")
        || lower.contains("session not created")
        || lower.contains("connection refused")
        || lower.contains("disconnected")
    {
        BrowserError::SessionLost(detail)
    } else if lower.contains("stale element")
        || lower.contains("detached")
        || lower.contains("not interactable")
        || lower.contains("click intercepted")
    {
        BrowserError::Detached(detail)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        BrowserError::Timeout(detail)
    } else {
        BrowserError::ElementNotFound(detail)
    }
}
