//! A stand-in quoting engine for local runs and demos.
//!
//! Securities and accounts come from a plain-text config file:
//!
//! ```text
//! # class  security  [initial price]
//! TQBR     SBER      250.5
//! SPBFUT   SiZ6
//! account  L01-00000F00  MC0002500000
//! ```
//!
//! A background thread moves every last price by a log-normal factor each
//! tick and reports the changes through [`EngineCallbacks`].

use crate::defs::{ENGINE_TICK_PERIOD_MSEC, VOLATILITY};
use crate::engine::{CallbackHandler, EngineCallbacks};
use crate::errors::{BridgeError, EngineError, SimulationError};
use crate::lock;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Name of the ordinary callback raised after every price move.
pub const ON_QUOTE_CALLBACK: &str = "OnQuote";

/// Last traded price.
pub const PARAM_LAST: &str = "LAST";
/// Traded volume of the last tick.
pub const PARAM_VOLUME: &str = "VOLUME";
/// Time of the last update, milliseconds since the UNIX epoch.
pub const PARAM_TIME: &str = "TIME";

/// A trading account as returned by `load-accounts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    /// Account code.
    pub account: String,
    /// Firm the account belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firm: Option<String>,
}

/// Live state of one security.
#[derive(Debug, Clone)]
pub struct SecurityQuote {
    /// Class code.
    pub class: String,

    /// Security code.
    pub security: String,

    /// Last traded price.
    pub last: f64,

    /// Volume of the last tick.
    pub volume: u32,

    /// Timestamp of the last update, measured in **milliseconds** since the UNIX epoch.
    pub timestamp: u64,
}

impl SecurityQuote {
    /// Creates a quote with the given price, or a random one in `[1, 1000)`.
    pub fn new(class: &str, security: &str, price: Option<f64>) -> Self {
        SecurityQuote {
            class: class.to_string(),
            security: security.to_string(),
            last: price.unwrap_or_else(|| 1.0 + rand::random::<f64>() * 999.0),
            volume: 0,
            timestamp: now_millis().unwrap_or_default(),
        }
    }

    /// Value of parameter `param`, `None` if unknown.
    pub fn param(&self, param: &str) -> Option<Value> {
        match param {
            PARAM_LAST => Some(json!(self.last)),
            PARAM_VOLUME => Some(json!(self.volume)),
            PARAM_TIME => Some(json!(self.timestamp)),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "class": self.class,
            "security": self.security,
            "last": self.last,
            "volume": self.volume,
            "time": self.timestamp,
        })
    }
}

fn now_millis() -> Result<u64, SimulationError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

/// A parallel random price generator.
///
/// Each rayon worker creates its own RNG (`StdRng`), so quotes can be
/// updated concurrently.
#[derive(Debug)]
pub struct PriceGenerator {
    /// Volatility (standard deviation) of the log-normal price distribution.
    volatility: f64,
}

impl PriceGenerator {
    /// Creates a new generator.
    ///
    /// # Errors
    /// Returns [`SimulationError::InvalidVolatility`] if `volatility <= 0.0` or `> 1.0`.
    pub fn new(volatility: f64) -> Result<Self, SimulationError> {
        if volatility <= 0.0 || volatility > 1.0 {
            return Err(SimulationError::InvalidVolatility(volatility));
        }
        Ok(Self { volatility })
    }

    /// Moves every quote yielded by `quotes`.
    pub fn update_quotes<'a, I>(&self, quotes: I) -> Result<(), SimulationError>
    where
        I: IntoIterator<Item = &'a mut SecurityQuote>,
        I::IntoIter: Send + 'a,
    {
        let log_normal = LogNormal::new(0.0, self.volatility)?;

        quotes.into_iter().par_bridge().try_for_each(|quote| {
            let mut rng = StdRng::from_entropy();
            update_single_quote(quote, &mut rng, &log_normal)
        })
    }
}

fn update_single_quote(
    quote: &mut SecurityQuote,
    rng: &mut StdRng,
    log_normal: &LogNormal<f64>,
) -> Result<(), SimulationError> {
    quote.last *= log_normal.sample(rng);
    quote.volume = 1 + (rand::random::<f64>() * 1000.0) as u32;
    quote.timestamp = now_millis()?;
    Ok(())
}

fn parse_price(raw: &str, line: usize) -> Result<f64, SimulationError> {
    raw.parse::<f64>()
        .ok()
        .filter(|p| *p > 0.0)
        .ok_or_else(|| SimulationError::InvalidConfig(format!("line {}: bad price '{}'", line, raw)))
}

type QuoteKey = (String, String);

/// Simulated engine: reference data from a config file plus a random walk
/// of last prices.
#[derive(Debug)]
pub struct SimulatedEngine {
    accounts: Vec<Account>,
    classes: Vec<String>,
    quotes: RwLock<BTreeMap<QuoteKey, SecurityQuote>>,
    generator: PriceGenerator,
    fast_callbacks: Mutex<BTreeMap<u64, String>>,
    tick: Duration,

    /// Background thread
    bg_thread: Mutex<Option<JoinHandle<()>>>,
    /// Graceful shutdown flag
    shutdown_flag: Arc<AtomicBool>,
}

impl SimulatedEngine {
    /// Loads securities and accounts from a config file.
    pub fn from_config<P: AsRef<Path>>(path: P) -> Result<Self, SimulationError> {
        log::info!("Loading engine configuration from: {:?}", path.as_ref());
        let file = File::open(&path).map_err(|e| SimulationError::InvalidConfig(e.to_string()))?;
        let reader = BufReader::new(file);

        let mut accounts = Vec::new();
        let mut classes: Vec<String> = Vec::new();
        let mut quotes = BTreeMap::new();

        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| SimulationError::InvalidConfig(e.to_string()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["account", account, rest @ ..] if rest.len() <= 1 => accounts.push(Account {
                    account: account.to_string(),
                    firm: rest.first().map(|f| f.to_string()),
                }),
                [class, security, rest @ ..] if rest.len() <= 1 => {
                    let price = rest
                        .first()
                        .map(|p| parse_price(p, n + 1))
                        .transpose()?;
                    if !classes.iter().any(|c| c == class) {
                        classes.push(class.to_string());
                    }
                    quotes.insert(
                        (class.to_string(), security.to_string()),
                        SecurityQuote::new(class, security, price),
                    );
                }
                _ => {
                    return Err(SimulationError::InvalidConfig(format!(
                        "line {}: expected 'CLASS SECURITY [PRICE]' or 'account ID [FIRM]', got '{}'",
                        n + 1,
                        line
                    )));
                }
            }
        }

        log::info!(
            "Loaded {} securities in {} classes and {} accounts",
            quotes.len(),
            classes.len(),
            accounts.len()
        );

        Ok(Self {
            accounts,
            classes,
            quotes: RwLock::new(quotes),
            generator: PriceGenerator::new(VOLATILITY)?,
            fast_callbacks: Mutex::new(BTreeMap::new()),
            tick: Duration::from_millis(ENGINE_TICK_PERIOD_MSEC),
            bg_thread: Mutex::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Overrides the tick period.
    pub fn with_tick_period(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Snapshot of one security.
    pub fn quote(&self, class: &str, security: &str) -> Option<SecurityQuote> {
        self.quotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(class.to_string(), security.to_string()))
            .cloned()
    }

    /// Starts the background thread that moves prices every tick and
    /// reports them to `callbacks`.
    ///
    /// The thread holds only weak references, so dropping the last
    /// reference to the engine or to `callbacks` stops it.
    pub fn start_background(
        self: &Arc<Self>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Result<(), SimulationError> {
        let mut guard = lock(&self.bg_thread);

        if guard.is_some() {
            log::warn!("Engine background thread already running");
            return Ok(());
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        let weak_callbacks: Weak<dyn EngineCallbacks> = Arc::downgrade(&callbacks);
        let shutdown = self.shutdown_flag.clone();
        let tick = self.tick;

        log::info!(
            "Starting engine background thread with tick period: {:?}",
            tick
        );

        let handle = thread::Builder::new()
            .name("engine".into())
            .spawn(move || {
                log::info!("Engine background thread started");
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(tick);

                    let (Some(engine), Some(callbacks)) =
                        (engine.upgrade(), weak_callbacks.upgrade())
                    else {
                        break;
                    };
                    if let Err(e) = engine.run_tick(&*callbacks) {
                        log::error!("Engine tick failed: {}", e);
                    }
                }
                log::info!("Engine background thread stopped");
            })
            .map_err(|e| SimulationError::ThreadError(e.to_string()))?;

        *guard = Some(handle);
        drop(guard);

        let count = self.quotes.read().unwrap_or_else(PoisonError::into_inner).len();
        callbacks.send_stdout_line(&format!("simulated engine started with {} securities", count));
        Ok(())
    }

    /// Signals the background thread to stop and joins it.
    pub fn shutdown(&self) {
        log::info!("Initiating engine shutdown");
        self.shutdown_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = lock(&self.bg_thread).take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from its own thread; it exits on the next check.
                return;
            }
            log::debug!("Waiting for engine background thread to finish");
            if handle.join().is_err() {
                log::error!("Engine background thread panicked");
            }
        }
    }

    /// One tick: move prices, push changes, raise callbacks.
    pub fn run_tick(&self, callbacks: &dyn EngineCallbacks) -> Result<(), SimulationError> {
        let moved: Vec<SecurityQuote> = {
            let mut quotes = self.quotes.write().unwrap_or_else(PoisonError::into_inner);
            self.generator.update_quotes(quotes.values_mut())?;
            quotes.values().cloned().collect()
        };
        log::debug!("Moved {} quotes", moved.len());

        let mut pushed = 0;
        for quote in &moved {
            pushed += callbacks.sec_params_update(
                &quote.class,
                &quote.security,
                PARAM_LAST,
                json!(quote.last),
            );
            pushed += callbacks.sec_params_changed(&quote.class, &quote.security);
            callbacks.callback_request(
                ON_QUOTE_CALLBACK,
                &[json!(quote.class), json!(quote.security), json!(quote.last)],
            );
        }
        log::trace!("Pushed {} parameter updates", pushed);

        let handles: Vec<(u64, String)> = lock(&self.fast_callbacks)
            .iter()
            .map(|(h, f)| (*h, f.clone()))
            .collect();
        for (handle, function) in handles {
            let args: Vec<Value> = moved.iter().map(SecurityQuote::to_json).collect();
            match callbacks.fast_callback_request(handle, &[Value::Array(args)]) {
                Ok(answer) => log::debug!("Fast callback {} answered {}", function, answer),
                Err(BridgeError::UnknownHandle(_)) | Err(BridgeError::ConnectionLost) => {
                    log::info!("Dropping fast callback {} (handle {})", function, handle);
                    lock(&self.fast_callbacks).remove(&handle);
                    callbacks.clear_fast_callback_data(handle);
                }
                Err(e) => log::warn!("Fast callback {} failed: {}", function, e),
            }
        }
        Ok(())
    }
}

impl CallbackHandler for SimulatedEngine {
    fn load_accounts(&self) -> Result<Value, EngineError> {
        serde_json::to_value(&self.accounts).map_err(|e| EngineError::Failed(e.to_string()))
    }

    fn load_classes(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.classes.clone())
    }

    fn load_class_securities(&self, class: &str) -> Result<Vec<String>, EngineError> {
        if !self.classes.iter().any(|c| c == class) {
            return Err(EngineError::InvalidArguments(format!("unknown class '{}'", class)));
        }
        Ok(self
            .quotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(c, _)| c == class)
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn param_value(&self, class: &str, security: &str, param: &str) -> Option<Value> {
        self.quote(class, security)?.param(param)
    }

    fn process_request(&self, method: &str, params: &Value) -> Result<Value, EngineError> {
        let field = |name: &str| {
            params
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::InvalidArguments(format!("missing field '{}'", name)))
        };
        match method {
            "get-param" => {
                let (class, security, param) = (field("class")?, field("security")?, field("param")?);
                self.param_value(class, security, param).ok_or_else(|| {
                    EngineError::InvalidArguments(format!("unknown {}/{}/{}", class, security, param))
                })
            }
            "get-quote" => {
                let (class, security) = (field("class")?, field("security")?);
                self.quote(class, security)
                    .map(|q| q.to_json())
                    .ok_or_else(|| EngineError::InvalidArguments(format!("unknown {}/{}", class, security)))
            }
            _ => Err(EngineError::UnknownMethod(method.to_string())),
        }
    }

    fn fast_callback_registered(&self, handle: u64, function: &str) {
        lock(&self.fast_callbacks).insert(handle, function.to_string());
    }

    fn release_object(&self, handle: u64) {
        lock(&self.fast_callbacks).remove(&handle);
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        log::debug!("SimulatedEngine drop called, initiating shutdown");
        self.shutdown();
    }
}
