use super::*;

/// The tree-walker recurses per JS call, so tests get the same large stack
/// the evaluator thread uses.
fn on_big_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap()
}

fn page(body: &str, script: &str) -> String {
    format!("<!DOCTYPE html><html><head><title>t</title></head><body>{body}<script>{script}</script></body></html>")
}

/// Run the page's scripts, then each predicate; returns script errors and
/// predicate results.
fn run(body: &str, script: &str, predicates: &[&str]) -> (Vec<String>, Vec<Result<bool, String>>) {
    let html = page(body, script);
    let predicates: Vec<String> = predicates.iter().map(|p| p.to_string()).collect();
    on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        let errors = realm.run_scripts().iter().map(|e| e.to_string()).collect();
        let results = predicates.iter().map(|p| realm.eval_predicate(p).map_err(|e| e.to_string())).collect();
        (errors, results)
    })
}

fn assert_all(body: &str, script: &str, predicates: &[&str]) {
    let (errors, results) = run(body, script, predicates);
    assert!(errors.is_empty(), "script errors: {errors:?}");
    for (p, r) in predicates.iter().zip(results) {
        assert_eq!(r, Ok(true), "predicate failed: {p}");
    }
}

/// Like [`assert_all`], with the virtual clock advanced by `ms` before the
/// predicates run.
fn assert_settled(body: &str, script: &str, ms: f64, predicates: &[&str]) {
    let html = page(body, script);
    let owned: Vec<String> = predicates.iter().map(|p| p.to_string()).collect();
    let (errors, results) = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        let mut errors: Vec<String> = realm.run_scripts().iter().map(|e| e.to_string()).collect();
        errors.extend(realm.advance(ms).iter().map(|e| e.to_string()));
        let results: Vec<Result<bool, String>> =
            owned.iter().map(|p| realm.eval_predicate(p).map_err(|e| e.to_string())).collect();
        (errors, results)
    });
    assert!(errors.is_empty(), "script errors: {errors:?}");
    for (p, r) in predicates.iter().zip(results) {
        assert_eq!(r, Ok(true), "predicate failed: {p}");
    }
}

fn script_error(script: &str) -> String {
    let (errors, _) = run("", script, &[]);
    assert_eq!(errors.len(), 1, "{errors:?}");
    errors[0].clone()
}

#[test]
fn language_basics() {
    assert_all(
        r#"<p id="out"></p>"#,
        r#"
        const doubled = [1, 2, 3].map(x => x * 2).join('-');
        let { a, b = 5, ...rest } = { a: 1, c: 3, d: 4 };
        const [first, , third = 'z'] = ['x', 'y'];
        function sum(...nums) { return nums.reduce((acc, n) => acc + n, 0); }
        document.getElementById('out').textContent = `${doubled}|${a}${b}|${Object.keys(rest)}|${first}${third}|${sum(1, 2, 3)}`;
        "#,
        &["document.getElementById('out').textContent === '2-4-6|15|c,d|xz|6'"],
    );
}

#[test]
fn closures_capture_each_loop_iteration() {
    assert_all(
        r#"<p id="out"></p>"#,
        r#"
        const fns = [];
        for (let i = 0; i < 3; i++) { fns.push(() => i); }
        var counter = (function () { let n = 0; return { inc: () => ++n }; })();
        counter.inc(); counter.inc();
        document.getElementById('out').textContent = fns.map(f => f()).join(',') + ':' + counter.inc();
        "#,
        &["document.getElementById('out').textContent === '0,1,2:3'"],
    );
}

#[test]
fn click_listeners_update_the_dom() {
    assert_all(
        r#"<button id="b">Add</button><span id="count">0</span>"#,
        r#"
        let count = 0;
        document.getElementById('b').addEventListener('click', () => {
          count++;
          document.getElementById('count').textContent = String(count);
        });
        "#,
        &[
            "document.getElementById('count').textContent === '0'",
            "(() => { const b = document.querySelector('#b'); b.click(); b.click(); return document.getElementById('count').textContent === '2'; })()",
        ],
    );
}

#[test]
fn events_bubble_and_stop() {
    assert_all(
        r#"<div id="outer"><button id="inner">x</button></div><p id="log"></p>"#,
        r#"
        const log = [];
        const outer = document.getElementById('outer');
        outer.addEventListener('click', () => log.push('outer-capture'), true);
        outer.addEventListener('click', () => log.push('outer'));
        document.getElementById('inner').addEventListener('click', e => {
          log.push('inner:' + e.target.id);
          if (log.length > 3) e.stopPropagation();
        });
        document.getElementById('inner').click();
        document.getElementById('inner').click();
        document.getElementById('log').textContent = log.join(' ');
        "#,
        &["document.getElementById('log').textContent === 'outer-capture inner:inner outer outer-capture inner:inner'"],
    );
}

#[test]
fn lifecycle_events_fire_after_scripts() {
    assert_all(
        "",
        r#"
        document.addEventListener('DOMContentLoaded', () => { document.body.dataset.ready = 'yes'; });
        window.onload = () => { document.body.setAttribute('data-loaded', '1'); };
        "#,
        &[
            "document.body.getAttribute('data-ready') === 'yes'",
            "document.body.getAttribute('data-loaded') === '1'",
        ],
    );
}

#[test]
fn timers_run_on_the_virtual_clock() {
    let html = page(
        r#"<p id="out">waiting</p>"#,
        r#"
        setTimeout(() => { document.getElementById('out').textContent = 'done'; }, 50);
        let ticks = 0;
        const id = setInterval(() => { ticks++; if (ticks === 3) clearInterval(id); document.body.dataset.ticks = ticks; }, 10);
        "#,
    );
    let (before, after, ticks) = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        assert!(realm.run_scripts().is_empty());
        let before = realm.eval_predicate("document.getElementById('out').textContent === 'done'").unwrap();
        assert!(realm.advance(100.0).is_empty());
        let after = realm.eval_predicate("document.getElementById('out').textContent === 'done'").unwrap();
        let ticks = realm.eval_predicate("document.body.dataset.ticks === '3'").unwrap();
        (before, after, ticks)
    });
    assert!(!before);
    assert!(after);
    assert!(ticks);
}

#[test]
fn predicates_only_see_document_and_window() {
    assert_all(
        "",
        "var shared = 1; const hidden = 2;",
        &[
            "typeof setTimeout === 'undefined'",
            "typeof window.setTimeout === 'function'",
            "window.shared === 1",
            "window.hidden === undefined",
            "typeof Math.max === 'function'",
        ],
    );
}

#[test]
fn optional_chaining_and_nullish() {
    assert_all(
        "",
        "",
        &[
            "(document.querySelector('.missing')?.textContent ?? 'none') === 'none'",
            "document.querySelector('title')?.textContent === 't'",
        ],
    );
}

#[test]
fn class_list_and_inline_style() {
    assert_all(
        r#"<div id="box" class="a"></div>"#,
        r#"
        const box = document.getElementById('box');
        box.classList.add('active');
        box.classList.toggle('a');
        box.style.backgroundColor = 'red';
        "#,
        &[
            "document.getElementById('box').className === 'active'",
            "document.getElementById('box').getAttribute('style') === 'background-color: red;'",
            "document.getElementById('box').style.backgroundColor === 'red'",
        ],
    );
}

#[test]
fn dom_building_and_queries() {
    assert_all(
        r#"<ul id="list"></ul>"#,
        r#"
        const list = document.getElementById('list');
        ['a', 'b', 'c'].forEach(t => {
          const li = document.createElement('li');
          li.textContent = t;
          list.appendChild(li);
        });
        list.insertAdjacentHTML('beforeend', '<li class="extra">d</li>');
        list.firstElementChild.remove();
        "#,
        &[
            "document.querySelectorAll('#list li').length === 3",
            "document.querySelector('#list li').textContent === 'b'",
            "document.getElementById('list').innerHTML === '<li>b</li><li>c</li><li class=\"extra\">d</li>'",
        ],
    );
}

#[test]
fn checkbox_clicks_toggle_state_and_fire_change() {
    assert_all(
        r#"<input type="checkbox" id="c"><p id="out"></p>"#,
        r#"
        document.getElementById('c').addEventListener('change', e => {
          document.getElementById('out').textContent = String(e.target.checked);
        });
        "#,
        &["(() => { document.getElementById('c').click(); return document.getElementById('out').textContent === 'true'; })()"],
    );
}

#[test]
fn form_submit_can_be_prevented() {
    assert_all(
        r#"<form id="f"><input id="name" value="Ada"><button>Go</button></form><p id="out"></p>"#,
        r#"
        document.getElementById('f').addEventListener('submit', e => {
          e.preventDefault();
          document.getElementById('out').textContent = 'Hi ' + document.getElementById('name').value;
        });
        "#,
        &["(() => { document.querySelector('button').click(); return document.getElementById('out').textContent === 'Hi Ada'; })()"],
    );
}

#[test]
fn json_and_builtins() {
    assert_all(
        "",
        "",
        &[
            r#"JSON.stringify({ a: [1, 2], b: 'x' }) === '{"a":[1,2],"b":"x"}'"#,
            "JSON.parse('[1, {\"k\": true}]')[1].k === true",
            "(0.1 + 0.2).toFixed(2) === '0.30'",
            "'a-b-c'.split('-').reverse().join('') === 'cba'",
            "'Hello World'.replace(/o/g, '0') === 'Hell0 W0rld'",
            "[3, 1, 10].sort((a, b) => a - b).join() === '1,3,10'",
            "[3, 1, 10].sort().join() === '1,10,3'",
            "new Set([1, 1, 2]).size === 2",
            "Math.max(...[4, 9, 2]) === 9",
            "parseInt('42px') === 42",
        ],
    );
}

#[test]
fn console_output_is_captured() {
    let html = page("", "console.log('hello', 42); console.warn({ a: 1 });");
    let lines = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        realm.run_scripts();
        realm.console().to_vec()
    });
    assert_eq!(lines, vec!["hello 42".to_string(), r#"{"a":1}"#.to_string()]);
}

#[test]
fn runtime_errors_use_browser_messages() {
    assert_eq!(script_error("const x = null; x.y;"), "Cannot read properties of null (reading 'y')");
    assert_eq!(script_error("const k = 1; k = 2;"), "Assignment to constant variable.");
    assert_eq!(script_error("missing();"), "missing is not defined");
    assert_eq!(script_error("const o = {}; o.run();"), "o.run is not a function");
    assert_eq!(script_error("throw new Error('boom');"), "boom");
    assert_eq!(script_error("let a = ;"), "Unexpected token ';'");
}

#[test]
fn caught_errors_expose_name_and_message() {
    assert_all(
        "",
        r#"
        try { null.x; } catch (e) { document.title = e.name + ':' + (e instanceof TypeError); }
        try { notDeclared(); } catch (e) { document.body.dataset.kind = e.name; }
        "#,
        &[
            "document.title === 'TypeError:true'",
            "document.body.dataset.kind === 'ReferenceError'",
        ],
    );
}

#[test]
fn runaway_scripts_hit_the_step_limit() {
    assert_eq!(script_error("while (true) {}"), ScriptError::StepLimit.to_string());
    assert_eq!(script_error("function f() { return f(); } f();"), "Maximum call stack size exceeded");
}

#[test]
fn step_limit_cannot_be_caught() {
    let (errors, results) = run(
        "",
        "try { for (;;) {} } catch (e) { document.title = 'caught'; }",
        &["document.title === 't'"],
    );
    assert_eq!(errors, vec![ScriptError::StepLimit.to_string()]);
    assert_eq!(results, vec![Ok(true)]);
}

#[test]
fn listener_errors_do_not_abort_dispatch() {
    let html = page(
        r#"<button id="b"></button>"#,
        r#"
        const b = document.getElementById('b');
        b.addEventListener('click', () => { throw new Error('first'); });
        b.addEventListener('click', () => { document.title = 'second ran'; });
        "#,
    );
    let (ok, console) = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        assert!(realm.run_scripts().is_empty());
        let ok = realm
            .eval_predicate("(() => { document.getElementById('b').click(); return document.title === 'second ran'; })()")
            .unwrap();
        (ok, realm.console().to_vec())
    });
    assert!(ok);
    assert_eq!(console, vec!["Uncaught first".to_string()]);
}

#[test]
fn non_javascript_scripts_are_skipped() {
    let html = "<html><body><script type=\"text/template\">not js at all {</script><script>document.title = 'ran';</script></body></html>";
    let title = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(html));
        assert!(realm.run_scripts().is_empty());
        realm.dom().title()
    });
    assert_eq!(title, "ran");
}

#[test]
fn classes_with_fields_accessors_and_super() {
    assert_all(
        r#"<p id="out"></p>"#,
        r#"
        class Shape {
          static count = 0;
          #id;
          constructor(name) { this.name = name; Shape.count++; this.#id = Shape.count; }
          get label() { return `${this.name}#${this.#id}`; }
          describe() { return 'shape ' + this.label; }
          static create(n) { return new this(n); }
        }
        class Square extends Shape {
          sides = 4;
          constructor(size) { super('square'); this.size = size; }
          get area() { return this.size ** 2; }
          set area(v) { this.size = Math.sqrt(v); }
          describe() { return super.describe() + ' of ' + this.sides; }
        }
        const s = new Square(3);
        s.area = 16;
        const parts = [s.describe(), s.area, s instanceof Shape, Shape.count, Object.keys(s).join(','), typeof Square, Square.create === Shape.create];
        document.getElementById('out').textContent = parts.join('|');
        try { Square(2); } catch (e) { document.title = e.message; }
        "#,
        &[
            "document.getElementById('out').textContent === 'shape square#1 of 4|16|true|1|name,sides,size|function|true'",
            "document.title === \"Class constructor Square cannot be invoked without 'new'\"",
        ],
    );
}

#[test]
fn classes_can_extend_error() {
    assert_all(
        "",
        r#"
        class ValidationError extends Error {
          constructor(field) { super(field + ' is required'); this.name = 'ValidationError'; this.field = field; }
        }
        try { throw new ValidationError('email'); } catch (e) {
          document.body.dataset.err = [e instanceof ValidationError, e instanceof Error, e.name, e.message, e.field].join('|');
        }
        "#,
        &["document.body.dataset.err === 'true|true|ValidationError|email is required|email'"],
    );
}

#[test]
fn object_getters_and_setters() {
    assert_all(
        "",
        r#"
        const temp = {
          celsius: 20,
          get fahrenheit() { return this.celsius * 9 / 5 + 32; },
          set fahrenheit(f) { this.celsius = (f - 32) * 5 / 9; },
        };
        temp.fahrenheit = 212;
        const box = {};
        Object.defineProperty(box, 'size', { get() { return 7; } });
        box.size = 99;
        const copy = { ...temp };
        document.body.dataset.ok = [temp.celsius, temp.fahrenheit, box.size, copy.fahrenheit, JSON.stringify(temp)].join('|');
        "#,
        &[r#"document.body.dataset.ok === '100|212|7|212|{"celsius":100,"fahrenheit":212}'"#],
    );
}

#[test]
fn promise_callbacks_run_as_microtasks() {
    assert_settled(
        "",
        r#"
        const log = [];
        setTimeout(() => log.push('timeout'), 0);
        Promise.resolve(1).then(v => { log.push('then' + v); return v + 1; }).then(v => log.push('then' + v));
        queueMicrotask(() => log.push('micro'));
        log.push('sync');
        new Promise((resolve, reject) => reject(new Error('bad')))
          .catch(e => log.push('caught ' + e.message))
          .finally(() => log.push('finally'));
        setTimeout(() => { document.body.dataset.ok = log.join(','); }, 5);
        "#,
        10.0,
        &["document.body.dataset.ok === 'sync,then1,micro,caught bad,then2,finally,timeout'"],
    );
}

#[test]
fn promise_combinators_settle_from_timers() {
    assert_settled(
        "",
        r#"
        const wait = (ms, v, fail) => new Promise((res, rej) => setTimeout(() => fail ? rej(new Error(v)) : res(v), ms));
        const data = document.body.dataset;
        Promise.all([wait(30, 'a'), 'b', wait(10, 'c')]).then(v => { data.all = v.join(''); });
        Promise.allSettled([wait(5, 'x'), wait(5, 'y', true)]).then(rs => { data.settled = rs.map(r => r.status).join(','); });
        Promise.race([wait(20, 'slow'), wait(10, 'fast')]).then(v => { data.race = v; });
        Promise.any([wait(5, 'e1', true), wait(15, 'ok')]).then(v => { data.any = v; });
        Promise.any([]).catch(e => { data.none = e.name; });
        "#,
        50.0,
        &[
            "document.body.dataset.all === 'abc'",
            "document.body.dataset.settled === 'fulfilled,rejected'",
            "document.body.dataset.race === 'fast'",
            "document.body.dataset.any === 'ok'",
            "document.body.dataset.none === 'AggregateError'",
        ],
    );
}

#[test]
fn async_functions_resume_after_await() {
    assert_settled(
        "",
        r#"
        const log = [];
        const sleep = ms => new Promise(r => setTimeout(r, ms));
        async function load(name) {
          log.push('start ' + name);
          const v = await Promise.resolve(name.toUpperCase());
          log.push('got ' + v);
          await sleep(20);
          for (let i = 0; i < 2; i++) { await null; log.push('loop ' + i); }
          return v + '!';
        }
        load('a').then(r => { log.push('done ' + r); document.body.dataset.ok = log.join(','); });
        log.push('after call');
        "#,
        50.0,
        &["document.body.dataset.ok === 'start a,after call,got A,loop 0,loop 1,done A!'"],
    );
}

#[test]
fn async_errors_reject_and_can_be_caught() {
    assert_settled(
        "",
        r#"
        async function fail() { await null; throw new TypeError('nope'); }
        async function main() {
          try { await fail(); } catch (e) { return 'caught ' + e.name + ' ' + e.message; }
        }
        main().then(v => { document.body.dataset.ok = v; });
        const arrow = async () => { throw new Error('arrow'); };
        arrow().catch(e => { document.title = e.message; });
        "#,
        0.0,
        &["document.body.dataset.ok === 'caught TypeError nope'", "document.title === 'arrow'"],
    );
}

#[test]
fn unhandled_rejections_are_reported() {
    let html = page("", "Promise.reject(new Error('lost')); Promise.reject(1).catch(() => {});");
    let (errors, console) = on_big_stack(move || {
        let mut realm = Realm::new(Dom::parse(&html));
        let errors: Vec<String> = realm.run_scripts().iter().map(|e| e.to_string()).collect();
        (errors, realm.console().to_vec())
    });
    assert_eq!(errors, vec!["lost".to_string()]);
    assert_eq!(console, vec!["Uncaught (in promise) Error: lost".to_string()]);
}

#[test]
fn local_storage_keeps_items() {
    assert_all(
        "",
        r#"
        localStorage.setItem('theme', 'dark');
        localStorage.count = 3;
        sessionStorage.setItem('tmp', 1);
        sessionStorage.removeItem('tmp');
        const keys = Object.keys(localStorage).join(',');
        document.body.dataset.ok = [
          localStorage.getItem('theme'), localStorage.count, localStorage.length, keys,
          localStorage.getItem('missing'), sessionStorage.length, localStorage.key(0), localStorage instanceof Storage,
        ].join('|');
        try { localStorage.setItem('big', 'x'.repeat(5000001)); } catch (e) { document.title = e.name; }
        "#,
        &[
            "document.body.dataset.ok === 'dark|3|2|theme,count||0|theme|true'",
            "document.title === 'QuotaExceededError'",
            "window.localStorage.getItem('theme') === 'dark'",
        ],
    );
}

#[test]
fn oversized_allocations_throw_range_errors() {
    assert_all(
        "",
        r#"
        const a = [];
        try { a.length = 2 ** 40; } catch (e) { document.body.dataset.len = e.name + ':' + e.message; }
        const b = [];
        try { b[4e9] = 1; } catch (e) { document.body.dataset.index = e.message; }
        let s = 'x';
        try { for (;;) s += s; } catch (e) { document.body.dataset.str = (e instanceof RangeError) + ':' + e.message; }
        document.body.dataset.sizes = a.length + ',' + b.length;
        "#,
        &[
            "document.body.dataset.len === 'RangeError:Invalid array length'",
            "document.body.dataset.index === 'Invalid array length'",
            "document.body.dataset.str === 'true:Invalid string length'",
            "document.body.dataset.sizes === '0,0'",
        ],
    );
}
